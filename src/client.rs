//! 클라이언트 (파일 요청 + 수신)
//!
//! 핸드쉐이크 순서:
//! REV 전송 -> challenge 응답 -> 인증 결과 -> 파일명 -> 존재 확인
//! -> Config 전송 -> 파일 크기 -> UDP 포트 전송 -> DONE 대기

use std::fs::File;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth;
use crate::codec::{BincodeEncoder, ControlChannel, ControlSender, Encoder};
use crate::message::{MessageKind, Packet, Payload, Status};
use crate::receiver::Receiver;
use crate::session::{self, unexpected_payload, ControlState, Transition};
use crate::stats::TransferStats;
use crate::transfer::{
    progress_channel, ClientTransfer, Progress, ProgressReceiver, ProgressSink, Transfer,
};
use crate::{Config, Error, PeerSettings, ReliabilityTuning, Result};

/// 종료 시 남은 컨트롤 패킷을 내보낼 시간
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// 클라이언트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// REV를 보냈고 AUTH challenge 대기
    AwaitChallenge,
    AwaitAuthResult,
    AwaitFileCheck,
    AwaitFileSize,
    /// 수신 엔진 실행 중, 서버의 DONE 에코 대기
    AwaitCompletion,
}

impl ClientState {
    /// 파일 크기를 받은 뒤 UDP 수신 엔진 시작
    async fn start_download(
        control: &ControlSender,
        ctx: &mut ClientTransfer,
        file_size: u64,
    ) -> Result<u16> {
        let bind_addr: SocketAddr = match ctx.server_addr {
            Some(addr) if addr.is_ipv6() => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        let port = socket.local_addr()?.port();
        let file = File::create(ctx.full_path())?;

        let receiver = Receiver::new(
            socket,
            file,
            ctx.config.clone(),
            file_size,
            control.clone(),
            ctx.encoder.clone(),
            ctx.progress.clone(),
            ctx.tuning.clone(),
        );
        let outcome_tx = ctx.outcome_tx.take().ok_or(Error::ChannelError)?;
        tokio::spawn(async move {
            let outcome = receiver.run().await;
            if let Err(e) = &outcome {
                warn!("수신 엔진 실패: {}", e);
            }
            let _ = outcome_tx.send(outcome).await;
        });

        Ok(port)
    }
}

impl ControlState for ClientState {
    type Context = ClientTransfer;

    fn name(&self) -> &'static str {
        match self {
            ClientState::AwaitChallenge => "AwaitChallenge",
            ClientState::AwaitAuthResult => "AwaitAuthResult",
            ClientState::AwaitFileCheck => "AwaitFileCheck",
            ClientState::AwaitFileSize => "AwaitFileSize",
            ClientState::AwaitCompletion => "AwaitCompletion",
        }
    }

    fn expects(&self) -> &'static [MessageKind] {
        match self {
            ClientState::AwaitChallenge | ClientState::AwaitAuthResult => &[MessageKind::Auth],
            ClientState::AwaitFileCheck | ClientState::AwaitFileSize => &[MessageKind::GetFile],
            ClientState::AwaitCompletion => &[MessageKind::Done],
        }
    }

    async fn on_packet(
        self,
        packet: Packet,
        control: &ControlSender,
        ctx: &mut ClientTransfer,
    ) -> Result<Transition<Self>> {
        match (self, &packet.payload) {
            (ClientState::AwaitChallenge, Payload::Bytes(challenge)) => {
                ctx.update_progress(Progress::handshaking(
                    "Version correct, Authenticating",
                    0.25,
                ));
                let response = auth::digest(challenge, &ctx.settings.secret);
                control.send(Packet::auth(response)).await?;
                Ok(Transition::Next(ClientState::AwaitAuthResult))
            }

            (ClientState::AwaitAuthResult, Payload::Bytes(status)) => {
                if Status::from_bytes(status) != Status::Ok {
                    return Err(Error::AuthenticationFailed);
                }
                ctx.update_progress(Progress::handshaking(
                    "Authenticated. Validating file with server",
                    0.5,
                ));
                control.send(Packet::filename(ctx.filename.clone())).await?;
                Ok(Transition::Next(ClientState::AwaitFileCheck))
            }

            (ClientState::AwaitFileCheck, Payload::Bytes(status)) => {
                if Status::from_bytes(status) != Status::Ok {
                    return Err(Error::FileNotFound(ctx.filename.clone()));
                }
                ctx.update_progress(Progress::handshaking(
                    "File exists, sending configuration",
                    0.75,
                ));
                control.send(Packet::config(ctx.config.clone())).await?;
                Ok(Transition::Next(ClientState::AwaitFileSize))
            }

            (ClientState::AwaitFileSize, Payload::FileSize(size)) => {
                let port = Self::start_download(control, ctx, *size).await?;
                control.send(Packet::port(port)).await?;
                ctx.update_progress(Progress::handshaking(
                    "Handshaking complete. Starting download",
                    1.0,
                ));
                Ok(Transition::Next(ClientState::AwaitCompletion))
            }

            (ClientState::AwaitCompletion, Payload::Empty) => Ok(Transition::Done),

            _ => Err(unexpected_payload(self, &packet)),
        }
    }
}

/// 파일 다운로드 클라이언트
#[derive(Clone)]
pub struct Client {
    local_directory: PathBuf,
    config: Config,
    settings: PeerSettings,
    encoder: Arc<dyn Encoder>,
    tuning: ReliabilityTuning,
}

impl Client {
    pub fn new(local_directory: impl Into<PathBuf>, config: Config, settings: PeerSettings) -> Self {
        Self {
            local_directory: local_directory.into(),
            config,
            settings,
            encoder: Arc::new(BincodeEncoder),
            tuning: ReliabilityTuning::default(),
        }
    }

    /// 인코더 교체
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// 재전송 타이밍 교체
    pub fn with_tuning(mut self, tuning: ReliabilityTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 백그라운드로 파일 요청
    ///
    /// 진행 상황 수신기와 최종 결과 핸들을 반환한다. 진행 상황은
    /// 수신기가 대기 중일 때만 전달된다.
    pub fn get_file(
        &self,
        filename: impl Into<String>,
        server_addr: SocketAddr,
    ) -> (ProgressReceiver, JoinHandle<Result<TransferStats>>) {
        let (sink, progress) = progress_channel();
        let client = self.clone();
        let filename = filename.into();
        let handle =
            tokio::spawn(async move { client.download(filename, server_addr, sink).await });
        (progress, handle)
    }

    /// 파일 요청 후 완료까지 대기
    ///
    /// 실패는 진행 상황에 한 번 보고된 뒤 반환된다.
    pub async fn download(
        &self,
        filename: impl Into<String>,
        server_addr: SocketAddr,
        progress: ProgressSink,
    ) -> Result<TransferStats> {
        let filename = filename.into();
        let result = self
            .download_inner(filename.clone(), server_addr, progress.clone())
            .await;
        match &result {
            Ok(stats) => info!("다운로드 완료: {} ({})", filename, stats.summary()),
            Err(e) => {
                warn!("다운로드 실패: {}: {}", filename, e);
                progress.publish(Progress::error(e.to_string()));
            }
        }
        result
    }

    async fn download_inner(
        &self,
        filename: String,
        server_addr: SocketAddr,
        progress: ProgressSink,
    ) -> Result<TransferStats> {
        let stream = TcpStream::connect(server_addr).await?;
        let mut channel = ControlChannel::new(stream, self.encoder.clone())?;
        debug!("서버 연결: {}", channel.peer_addr());

        let (outcome_tx, mut outcome_rx) = mpsc::channel(1);
        let mut ctx = ClientTransfer::new(
            filename,
            self.local_directory.clone(),
            self.config.clone(),
            self.settings.clone(),
            progress,
        );
        ctx.tuning = self.tuning.clone();
        ctx.server_addr = Some(channel.peer_addr());
        ctx.encoder = self.encoder.clone();
        ctx.outcome_tx = Some(outcome_tx);

        ctx.update_progress(Progress::handshaking("Sending client version", 0.0));
        channel
            .sender()
            .send(Packet::revision(self.settings.revision))
            .await?;

        let result = {
            let session = session::run(ClientState::AwaitChallenge, &mut channel, &mut ctx);
            tokio::pin!(session);

            tokio::select! {
                finished = &mut session => match finished {
                    Ok(()) => outcome_rx.recv().await.unwrap_or(Err(Error::ConnectionClosed)),
                    Err(e) => Err(e),
                },
                // 수신 엔진이 먼저 끝나면 DONE 에코까지 세션을 마저 돌린다
                Some(outcome) = outcome_rx.recv() => match outcome {
                    Ok(stats) => session.await.map(|()| stats),
                    Err(e) => Err(e),
                },
            }
        };

        channel.close(CLOSE_LINGER).await;
        result
    }
}
