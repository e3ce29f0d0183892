//! # NAMI
//!
//! TCP 컨트롤 채널 + UDP 데이터 채널로 나뉜 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **분리된 채널**: 핸드쉐이크와 재전송 신호는 TCP, 블록 데이터는 UDP
//! - **상태 머신**: 클라이언트/서버가 같은 구동기에 서로 다른 상태 테이블
//! - **블록 신뢰성**: 누락 감지, 개별 재전송, 누락이 많으면 restart
//! - **적응형 전송률**: 손실률 보고에 따라 감속/가속
//! - **공유 비밀 인증**: challenge XOR secret 해시 (암호화 아님)
//! - **non-blocking 진행 상황**: 소비자가 없으면 버림

pub mod auth;
pub mod blockio;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod stats;
pub mod transfer;

pub use client::Client;
pub use codec::{BincodeEncoder, Encoder};
pub use config::{Config, PeerSettings, ReliabilityTuning};
pub use error::{Error, Result};
pub use message::{Block, BlockKind, MessageKind, Packet, Payload, Retransmit};
pub use receiver::BlockTracker;
pub use sender::RateController;
pub use server::Server;
pub use stats::TransferStats;
pub use transfer::{Progress, ProgressKind, ProgressReceiver, ProgressSink};

/// 프로토콜 리비전 (기본값, 양측이 정확히 같아야 함)
pub const PROTOCOL_REVISION: u32 = 20061025;

/// 기본 서버 포트
pub const DEFAULT_LISTEN_PORT: u16 = 46224;

/// 매직 넘버 (TCP 프레임 식별용)
pub const MAGIC_NUMBER: u32 = 0x4E414D49; // "NAMI"

/// 최대 블록 크기 (UDP 데이터그램 하나에 들어가야 함)
pub const MAX_BLOCK_SIZE: usize = 65000;
