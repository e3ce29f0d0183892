//! 서버 (파일 제공)
//!
//! 연결마다 하나의 상태 머신을 돌리고, 데이터 포트를 받으면 송신 워커를
//! 띄운 뒤 전송 중 컨트롤 메시지(RETRANSMIT, ERROR_RATE, DONE)를 워커로
//! 넘긴다.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::TrySendError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::auth;
use crate::codec::{BincodeEncoder, ControlChannel, ControlSender, Encoder};
use crate::message::{MessageKind, Packet, Payload, Status};
use crate::sender::{ControlMessage, FileSender};
use crate::session::{self, unexpected_payload, ControlState, Transition};
use crate::transfer::{
    is_confined, progress_channel, Progress, ProgressReceiver, ServerTransfer, Transfer,
};
use crate::{Error, PeerSettings, Result};

/// 상태 머신 -> 송신 워커 큐 깊이
const CONTROL_QUEUE: usize = 64;

/// 종료 시 남은 컨트롤 패킷을 내보낼 시간
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// 새 연결의 진행 상황 수신기 알림
pub type TransferAnnouncements = crossbeam_channel::Receiver<ProgressReceiver>;

/// 서버 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitRevision,
    /// challenge를 보냈고 응답 대기 (challenge는 컨텍스트에 보관)
    AwaitAuthResponse,
    AwaitFilename,
    AwaitConfig,
    AwaitDataPort,
    /// 송신 워커 실행 중
    Transferring,
}

impl ServerState {
    /// 송신 워커로 전달 (워커가 이미 끝났으면 ChannelError)
    async fn forward(
        tx: Option<&mpsc::Sender<ControlMessage>>,
        message: ControlMessage,
    ) -> Result<()> {
        let tx = tx.ok_or(Error::ChannelError)?;
        tx.send(message).await.map_err(|_| Error::ChannelError)
    }
}

impl ControlState for ServerState {
    type Context = ServerTransfer;

    fn name(&self) -> &'static str {
        match self {
            ServerState::AwaitRevision => "AwaitRevision",
            ServerState::AwaitAuthResponse => "AwaitAuthResponse",
            ServerState::AwaitFilename => "AwaitFilename",
            ServerState::AwaitConfig => "AwaitConfig",
            ServerState::AwaitDataPort => "AwaitDataPort",
            ServerState::Transferring => "Transferring",
        }
    }

    fn expects(&self) -> &'static [MessageKind] {
        match self {
            ServerState::AwaitRevision => &[MessageKind::Rev],
            ServerState::AwaitAuthResponse => &[MessageKind::Auth],
            ServerState::AwaitFilename | ServerState::AwaitConfig | ServerState::AwaitDataPort => {
                &[MessageKind::GetFile]
            }
            ServerState::Transferring => &[
                MessageKind::Retransmit,
                MessageKind::ErrorRate,
                MessageKind::Done,
            ],
        }
    }

    async fn on_packet(
        self,
        packet: Packet,
        control: &ControlSender,
        ctx: &mut ServerTransfer,
    ) -> Result<Transition<Self>> {
        match (self, packet.payload) {
            (ServerState::AwaitRevision, Payload::Revision(revision)) => {
                ctx.update_progress(Progress::handshaking("Comparing versions", 0.25));
                if revision != ctx.settings.revision {
                    return Err(Error::RevisionMismatch {
                        expected: ctx.settings.revision,
                        got: revision,
                    });
                }

                let challenge = auth::generate_challenge();
                control.send(Packet::auth(challenge.clone())).await?;
                ctx.challenge = Some(challenge);
                Ok(Transition::Next(ServerState::AwaitAuthResponse))
            }

            (ServerState::AwaitAuthResponse, Payload::Bytes(response)) => {
                let challenge = ctx.challenge.take().ok_or(Error::AuthenticationFailed)?;
                if !auth::verify(&challenge, &ctx.settings.secret, &response) {
                    control.send(Packet::auth_status(Status::Failed)).await?;
                    return Err(Error::AuthenticationFailed);
                }
                ctx.update_progress(Progress::handshaking("Authentication successful", 0.5));
                control.send(Packet::auth_status(Status::Ok)).await?;
                Ok(Transition::Next(ServerState::AwaitFilename))
            }

            (ServerState::AwaitFilename, Payload::Filename(filename)) => {
                let is_file = is_confined(&filename)
                    && tokio::fs::metadata(ctx.local_directory.join(&filename))
                        .await
                        .is_ok_and(|meta| meta.is_file());
                if !is_file {
                    control.send(Packet::file_status(Status::Failed)).await?;
                    return Err(Error::FileNotFound(filename));
                }
                ctx.filename = filename;
                control.send(Packet::file_status(Status::Ok)).await?;
                ctx.update_progress(Progress::handshaking("File found", 0.75));
                Ok(Transition::Next(ServerState::AwaitConfig))
            }

            (ServerState::AwaitConfig, Payload::Config(config)) => {
                config.validate()?;
                ctx.file_size = tokio::fs::metadata(ctx.full_path()).await?.len();
                ctx.config = config;
                control.send(Packet::file_size(ctx.file_size)).await?;
                ctx.update_progress(Progress::handshaking(
                    "Configuration received. Handshaking complete",
                    1.0,
                ));
                Ok(Transition::Next(ServerState::AwaitDataPort))
            }

            (ServerState::AwaitDataPort, Payload::Port(port)) => {
                let target = SocketAddr::new(ctx.peer_addr.ip(), port);
                let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
                let sender = FileSender::new(
                    ctx.config.clone(),
                    ctx.full_path(),
                    target,
                    ctx.encoder.clone(),
                    ctx.progress.clone(),
                );
                ctx.sender_task = Some(tokio::spawn(sender.run(control_rx)));
                ctx.control_tx = Some(control_tx);
                ctx.update_progress(Progress::transferring("Starting transfer", 0.0));
                Ok(Transition::Next(ServerState::Transferring))
            }

            (ServerState::Transferring, Payload::Retransmit(retransmit)) => {
                let message = ControlMessage::Retransmit(retransmit);
                Self::forward(ctx.control_tx.as_ref(), message).await?;
                Ok(Transition::Next(ServerState::Transferring))
            }

            (ServerState::Transferring, Payload::ErrorRate(ratio)) => {
                let message = ControlMessage::ErrorRate(ratio);
                Self::forward(ctx.control_tx.as_ref(), message).await?;
                Ok(Transition::Next(ServerState::Transferring))
            }

            (ServerState::Transferring, Payload::Empty) if packet.kind == MessageKind::Done => {
                Self::forward(ctx.control_tx.as_ref(), ControlMessage::Done).await?;
                ctx.control_tx = None;

                // 워커가 모두 멈춘 뒤에 DONE 에코
                if let Some(task) = ctx.sender_task.take() {
                    match task.await {
                        Ok(Ok(stats)) => debug!("송신 통계: {}", stats.summary()),
                        Ok(Err(e)) => return Err(e),
                        Err(e) => warn!("송신 워커 비정상 종료: {}", e),
                    }
                }
                control.send(Packet::done()).await?;
                ctx.update_progress(Progress::transferring("Transfer complete", 1.0));
                Ok(Transition::Done)
            }

            (state, payload) => Err(unexpected_payload(
                state,
                &Packet {
                    kind: packet.kind,
                    payload,
                },
            )),
        }
    }
}

/// 파일 서버
pub struct Server {
    listener: TcpListener,
    local_directory: PathBuf,
    settings: PeerSettings,
    encoder: Arc<dyn Encoder>,
    announce_tx: crossbeam_channel::Sender<ProgressReceiver>,
    announce_rx: TransferAnnouncements,
}

impl Server {
    /// 리스너 바인딩
    pub async fn bind(
        addr: SocketAddr,
        local_directory: impl Into<PathBuf>,
        settings: PeerSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (announce_tx, announce_rx) = crossbeam_channel::bounded(0);
        Ok(Self {
            listener,
            local_directory: local_directory.into(),
            settings,
            encoder: Arc::new(BincodeEncoder),
            announce_tx,
            announce_rx,
        })
    }

    /// 인코더 교체
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 새 연결마다 그 연결의 진행 상황 수신기가 전달된다
    ///
    /// 연결 수락 시점에 대기 중인 소비자가 없으면 알림은 버려진다.
    pub fn transfers(&self) -> TransferAnnouncements {
        self.announce_rx.clone()
    }

    /// 연결 수락 루프 (반환하지 않음)
    pub async fn run(self) -> Result<()> {
        info!(
            "NAMI 서버 시작: {}, dir={}",
            self.listener.local_addr()?,
            self.local_directory.display()
        );

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("연결 수락 실패: {}", e);
                    continue;
                }
            };
            info!("연결 수락: {}", peer_addr);

            let (sink, progress) = progress_channel();
            match self.announce_tx.try_send(progress) {
                Ok(()) => debug!("진행 상황 리스너 연결: {}", peer_addr),
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    trace!("진행 상황 리스너 없음: {}", peer_addr)
                }
            }

            let mut ctx = ServerTransfer::new(
                self.local_directory.clone(),
                self.settings.clone(),
                sink,
                peer_addr,
            );
            ctx.encoder = self.encoder.clone();
            tokio::spawn(handle_connection(stream, ctx));
        }
    }
}

/// 연결 하나 처리
async fn handle_connection(stream: TcpStream, mut ctx: ServerTransfer) {
    let peer_addr = ctx.peer_addr();
    let mut channel = match ControlChannel::new(stream, ctx.encoder.clone()) {
        Ok(channel) => channel,
        Err(e) => {
            warn!("컨트롤 채널 생성 실패: {}: {}", peer_addr, e);
            return;
        }
    };

    let result = session::run(ServerState::AwaitRevision, &mut channel, &mut ctx).await;

    if let Err(e) = &result {
        if e.is_protocol_violation() {
            warn!("프로토콜 위반: {}: {}", peer_addr, e);
        } else {
            warn!("연결 실패: {}: {}", peer_addr, e);
        }
        ctx.update_progress(Progress::error(e.to_string()));

        // 컨트롤 채널을 닫아 송신 워커를 정리
        ctx.control_tx = None;
        if let Some(task) = ctx.sender_task.take() {
            let _ = task.await;
        }
    }

    channel.close(CLOSE_LINGER).await;
    info!("연결 종료: {}", peer_addr);
}
