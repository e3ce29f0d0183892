//! 프로토콜 메시지 정의
//!
//! 모든 메시지는 `Packet { kind, payload }` 형태이며 페이로드의 모양은
//! kind에 의해 결정된다. 디코더는 항상 강타입 페이로드를 돌려준다.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Config;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// 인증 (challenge, 응답, 결과)
    Auth = 1,

    /// 프로토콜 리비전
    Rev = 2,

    /// 파일 요청 단계 (파일명, 존재 확인, 설정, 크기, UDP 포트)
    GetFile = 3,

    /// 데이터 블록 (UDP)
    Data = 4,

    /// 재전송 요청
    Retransmit = 5,

    /// 손실률 보고
    ErrorRate = 6,

    /// 전송 완료
    Done = 7,
}

/// 블록 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// 최초 전송 (restart로 다시 보내는 블록 포함)
    Original,

    /// 개별 재전송
    Retransmitted,
}

/// 파일 블록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// 0부터 시작하는 블록 번호
    pub number: u64,

    /// 블록 데이터 (마지막 블록만 block_size보다 짧음)
    pub data: Bytes,

    pub kind: BlockKind,

    /// CRC32 체크섬
    pub crc32: u32,
}

impl Block {
    pub fn new(number: u64, data: Bytes, kind: BlockKind) -> Self {
        let crc32 = crc32fast::hash(&data);
        Self {
            number,
            data,
            kind,
            crc32,
        }
    }

    /// CRC 검증
    pub fn verify_crc(&self) -> bool {
        crc32fast::hash(&self.data) == self.crc32
    }
}

/// 재전송 요청
///
/// `is_restart`이면 `block_nums`는 정확히 하나이며, 그 번호부터 끝까지
/// ORIGINAL로 다시 보낸다. 아니면 나열된 블록만 RETRANSMITTED로 보낸다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retransmit {
    pub is_restart: bool,

    /// 오름차순, 중복 없음
    pub block_nums: Vec<u64>,
}

impl Retransmit {
    pub fn restart(from: u64) -> Self {
        Self {
            is_restart: true,
            block_nums: vec![from],
        }
    }

    pub fn selective(block_nums: Vec<u64>) -> Self {
        Self {
            is_restart: false,
            block_nums,
        }
    }
}

/// 상태 바이트 (AUTH 결과, 파일 존재 확인)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed,
}

impl Status {
    pub const OK_BYTE: u8 = 0x00;
    pub const FAILED_BYTE: u8 = 0x01;

    pub fn to_byte(self) -> u8 {
        match self {
            Status::Ok => Self::OK_BYTE,
            Status::Failed => Self::FAILED_BYTE,
        }
    }

    /// 첫 바이트가 0x00이 아니면 실패
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes.first() {
            Some(&Self::OK_BYTE) => Status::Ok,
            _ => Status::Failed,
        }
    }
}

/// 페이로드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Revision(u32),
    Bytes(Bytes),
    Filename(String),
    Config(Config),
    FileSize(u64),
    Port(u16),
    Block(Block),
    Retransmit(Retransmit),
    ErrorRate(f64),
}

impl Payload {
    /// 로그용 이름
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Revision(_) => "revision",
            Payload::Bytes(_) => "bytes",
            Payload::Filename(_) => "filename",
            Payload::Config(_) => "config",
            Payload::FileSize(_) => "file_size",
            Payload::Port(_) => "port",
            Payload::Block(_) => "block",
            Payload::Retransmit(_) => "retransmit",
            Payload::ErrorRate(_) => "error_rate",
        }
    }
}

/// 패킷 (두 채널 공통 봉투)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: MessageKind,
    pub payload: Payload,
}

impl Packet {
    pub fn revision(revision: u32) -> Self {
        Self {
            kind: MessageKind::Rev,
            payload: Payload::Revision(revision),
        }
    }

    pub fn auth(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Auth,
            payload: Payload::Bytes(bytes.into()),
        }
    }

    pub fn auth_status(status: Status) -> Self {
        Self::auth(vec![status.to_byte()])
    }

    pub fn filename(name: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::GetFile,
            payload: Payload::Filename(name.into()),
        }
    }

    pub fn file_status(status: Status) -> Self {
        Self {
            kind: MessageKind::GetFile,
            payload: Payload::Bytes(Bytes::from(vec![status.to_byte()])),
        }
    }

    pub fn config(config: Config) -> Self {
        Self {
            kind: MessageKind::GetFile,
            payload: Payload::Config(config),
        }
    }

    pub fn file_size(size: u64) -> Self {
        Self {
            kind: MessageKind::GetFile,
            payload: Payload::FileSize(size),
        }
    }

    pub fn port(port: u16) -> Self {
        Self {
            kind: MessageKind::GetFile,
            payload: Payload::Port(port),
        }
    }

    pub fn data(block: Block) -> Self {
        Self {
            kind: MessageKind::Data,
            payload: Payload::Block(block),
        }
    }

    pub fn retransmit(retransmit: Retransmit) -> Self {
        Self {
            kind: MessageKind::Retransmit,
            payload: Payload::Retransmit(retransmit),
        }
    }

    pub fn error_rate(ratio: f64) -> Self {
        Self {
            kind: MessageKind::ErrorRate,
            payload: Payload::ErrorRate(ratio),
        }
    }

    pub fn done() -> Self {
        Self {
            kind: MessageKind::Done,
            payload: Payload::Empty,
        }
    }

    /// kind와 페이로드 모양이 맞는지 확인
    pub fn is_well_formed(&self) -> bool {
        match (self.kind, &self.payload) {
            (MessageKind::Rev, Payload::Revision(_)) => true,
            (MessageKind::Auth, Payload::Bytes(_)) => true,
            (
                MessageKind::GetFile,
                Payload::Filename(_)
                | Payload::Bytes(_)
                | Payload::Config(_)
                | Payload::FileSize(_)
                | Payload::Port(_),
            ) => true,
            (MessageKind::Data, Payload::Block(_)) => true,
            (MessageKind::Retransmit, Payload::Retransmit(r)) => {
                !r.is_restart || r.block_nums.len() == 1
            }
            (MessageKind::ErrorRate, Payload::ErrorRate(_)) => true,
            (MessageKind::Done, Payload::Empty) => true,
            _ => false,
        }
    }
}
