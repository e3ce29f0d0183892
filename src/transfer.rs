//! 연결별 전송 컨텍스트와 진행 상황 보고
//!
//! 진행 상황은 best-effort: 받는 쪽이 지금 대기 중이 아니면 버린다.
//! 프로토콜 진행은 절대 진행 상황 소비자를 기다리지 않는다.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::TrySendError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::codec::{BincodeEncoder, Encoder};
use crate::sender::ControlMessage;
use crate::stats::TransferStats;
use crate::{Config, PeerSettings, ReliabilityTuning, Result};

/// 진행 상황 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Handshaking,
    Transferring,
    Error,
}

/// 진행 상황
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub kind: ProgressKind,
    pub message: String,
    /// 0.0 ~ 1.0
    pub percentage: f64,
}

impl Progress {
    pub fn handshaking(message: impl Into<String>, percentage: f64) -> Self {
        Self {
            kind: ProgressKind::Handshaking,
            message: message.into(),
            percentage,
        }
    }

    pub fn transferring(message: impl Into<String>, percentage: f64) -> Self {
        Self {
            kind: ProgressKind::Transferring,
            message: message.into(),
            percentage,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Error,
            message: message.into(),
            percentage: 0.0,
        }
    }
}

/// 진행 상황 수신기
pub type ProgressReceiver = crossbeam_channel::Receiver<Progress>;

/// 진행 상황 송신기 (non-blocking)
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<crossbeam_channel::Sender<Progress>>,
}

impl ProgressSink {
    /// 소비자가 없는 sink
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// 발행 (대기 중인 소비자가 없으면 버림)
    pub fn publish(&self, progress: Progress) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(progress) {
            Ok(()) => {}
            Err(TrySendError::Full(p)) | Err(TrySendError::Disconnected(p)) => {
                trace!("진행 상황 리스너 없음, 버림: {}", p.message);
            }
        }
    }
}

/// 랑데부 채널: 소비자가 `recv()`로 대기 중일 때만 전달된다
pub fn progress_channel() -> (ProgressSink, ProgressReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(0);
    (ProgressSink { tx: Some(tx) }, rx)
}

/// 상태 머신에 노출되는 전송 컨텍스트
pub trait Transfer {
    fn update_progress(&self, progress: Progress);

    fn config(&self) -> &Config;

    fn filename(&self) -> &str;

    fn local_directory(&self) -> &Path;

    fn full_path(&self) -> PathBuf {
        self.local_directory().join(self.filename())
    }
}

/// 로컬 디렉터리 밖을 가리키는 파일명 거부
pub fn is_confined(filename: &str) -> bool {
    let path = Path::new(filename);
    !filename.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// 클라이언트(수신측) 컨텍스트
pub struct ClientTransfer {
    pub(crate) filename: String,
    pub(crate) local_directory: PathBuf,
    pub(crate) config: Config,
    pub(crate) settings: PeerSettings,
    pub(crate) progress: ProgressSink,
    pub(crate) tuning: ReliabilityTuning,
    pub(crate) server_addr: Option<SocketAddr>,
    pub(crate) encoder: Arc<dyn Encoder>,
    /// UDP 수신 엔진의 최종 결과 (엔진 태스크로 옮겨진다)
    pub(crate) outcome_tx: Option<mpsc::Sender<Result<TransferStats>>>,
}

impl ClientTransfer {
    pub fn new(
        filename: impl Into<String>,
        local_directory: impl Into<PathBuf>,
        config: Config,
        settings: PeerSettings,
        progress: ProgressSink,
    ) -> Self {
        Self {
            filename: filename.into(),
            local_directory: local_directory.into(),
            config,
            settings,
            progress,
            tuning: ReliabilityTuning::default(),
            server_addr: None,
            encoder: Arc::new(BincodeEncoder),
            outcome_tx: None,
        }
    }
}

impl Transfer for ClientTransfer {
    fn update_progress(&self, progress: Progress) {
        self.progress.publish(progress);
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn filename(&self) -> &str {
        &self.filename
    }

    fn local_directory(&self) -> &Path {
        &self.local_directory
    }
}

/// 서버(송신측) 컨텍스트
pub struct ServerTransfer {
    pub(crate) filename: String,
    pub(crate) local_directory: PathBuf,
    pub(crate) config: Config,
    pub(crate) settings: PeerSettings,
    pub(crate) progress: ProgressSink,
    pub(crate) peer_addr: SocketAddr,
    /// 응답 검증 전까지 보관하는 challenge
    pub(crate) challenge: Option<Vec<u8>>,
    pub(crate) file_size: u64,
    pub(crate) encoder: Arc<dyn Encoder>,
    /// 상태 머신 -> 송신 워커
    pub(crate) control_tx: Option<mpsc::Sender<ControlMessage>>,
    pub(crate) sender_task: Option<JoinHandle<Result<TransferStats>>>,
}

impl ServerTransfer {
    pub fn new(
        local_directory: impl Into<PathBuf>,
        settings: PeerSettings,
        progress: ProgressSink,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            filename: String::new(),
            local_directory: local_directory.into(),
            config: Config::default(),
            settings,
            progress,
            peer_addr,
            challenge: None,
            file_size: 0,
            encoder: Arc::new(BincodeEncoder),
            control_tx: None,
            sender_task: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Transfer for ServerTransfer {
    fn update_progress(&self, progress: Progress) {
        self.progress.publish(progress);
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn filename(&self) -> &str {
        &self.filename
    }

    fn local_directory(&self) -> &Path {
        &self.local_directory
    }
}
