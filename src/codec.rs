//! 패킷 인코딩과 TCP 프레이밍
//!
//! - [`Encoder`]: 패킷 <-> 바이트 (교체 가능)
//! - [`FrameHeader`]: TCP 스트림 위의 메시지 경계
//! - [`ControlChannel`]: 프레임 단위 읽기 + 전용 쓰기 태스크

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::message::Packet;
use crate::{Error, Result, MAGIC_NUMBER};

/// 최대 프레임 크기
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// 쓰기 큐 깊이
const OUTBOUND_QUEUE: usize = 256;

/// 패킷 인코더
///
/// `decode(encode(p))`는 p와 같은 강타입 페이로드를 복원해야 한다.
pub trait Encoder: Send + Sync + 'static {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> Result<Packet>;
}

/// bincode 기반 기본 인코더
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeEncoder;

impl Encoder for BincodeEncoder {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        Ok(bincode::serialize(packet)?)
    }

    fn decode(&self, data: &[u8]) -> Result<Packet> {
        let packet: Packet = bincode::deserialize(data)?;
        if !packet.is_well_formed() {
            return Err(Error::MalformedPacket { kind: packet.kind });
        }
        Ok(packet)
    }
}

/// TCP 프레임 헤더: magic(4) + len(4), big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    pub fn new(len: usize) -> Result<Self> {
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge {
                size: len,
                limit: MAX_FRAME_LEN,
            });
        }
        Ok(Self {
            magic: MAGIC_NUMBER,
            len: len as u32,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// 헤더 파싱 + 매직/크기 검증
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: magic,
            });
        }
        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if len as usize > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge {
                size: len as usize,
                limit: MAX_FRAME_LEN,
            });
        }
        Ok(Self { magic, len })
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> Result<()> {
    let header = FrameHeader::new(payload.len())?;
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// 컨트롤 채널 송신 핸들
///
/// 여러 태스크(상태 머신, 수신 엔진)가 복제해서 사용한다.
/// 실제 쓰기는 하나의 쓰기 태스크가 순서대로 처리한다.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Packet>,
}

impl ControlSender {
    /// TCP 없이 채널에 직접 연결 (엔진 단위 테스트용)
    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::Sender<Packet>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        trace!("컨트롤 패킷 큐잉: {:?}", packet.kind);
        self.tx.send(packet).await.map_err(|_| Error::ChannelError)
    }
}

/// TCP 컨트롤 채널
pub struct ControlChannel {
    reader: OwnedReadHalf,
    outbound: ControlSender,
    writer_task: JoinHandle<()>,
    encoder: Arc<dyn Encoder>,
    peer_addr: SocketAddr,
}

impl ControlChannel {
    pub fn new(stream: TcpStream, encoder: Arc<dyn Encoder>) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Packet>(OUTBOUND_QUEUE);

        let write_encoder = encoder.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let bytes = match write_encoder.encode(&packet) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("패킷 인코딩 실패: {}", e);
                        break;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    warn!("컨트롤 채널 쓰기 실패: {}", e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
            debug!("컨트롤 채널 쓰기 태스크 종료");
        });

        Ok(Self {
            reader,
            outbound: ControlSender { tx },
            writer_task,
            encoder,
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn sender(&self) -> ControlSender {
        self.outbound.clone()
    }

    /// 다음 패킷 하나 읽기
    pub async fn recv(&mut self) -> Result<Packet> {
        let mut header = [0u8; FrameHeader::SIZE];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::from_bytes(header)?;

        let mut payload = vec![0u8; header.len as usize];
        self.reader.read_exact(&mut payload).await?;
        self.encoder.decode(&payload)
    }

    /// 쓰기 큐를 비우고 종료
    ///
    /// 복제된 송신 핸들이 남아 있으면 최대 `linger`만큼 기다린다.
    pub async fn close(self, linger: Duration) {
        let ControlChannel {
            outbound,
            writer_task,
            ..
        } = self;
        drop(outbound);
        if tokio::time::timeout(linger, writer_task).await.is_err() {
            debug!("컨트롤 채널 쓰기 태스크 대기 시간 초과");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::{Block, BlockKind, MessageKind, Payload, Retransmit};
    use crate::Config;

    #[test]
    fn test_encoder_restores_typed_payloads() {
        let encoder = BincodeEncoder;
        let packets = vec![
            Packet::config(Config::lossy_network()),
            Packet::data(Block::new(
                9,
                Bytes::from(vec![7u8; 100]),
                BlockKind::Retransmitted,
            )),
            Packet::retransmit(Retransmit::selective(vec![1, 5, 9])),
            Packet::error_rate(0.125),
        ];

        for packet in packets {
            let bytes = encoder.encode(&packet).unwrap();
            let decoded = encoder.decode(&bytes).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_decoder_rejects_mismatched_payload() {
        let encoder = BincodeEncoder;
        let packet = Packet {
            kind: MessageKind::Rev,
            payload: Payload::Filename("x".into()),
        };
        let bytes = encoder.encode(&packet).unwrap();
        assert!(matches!(
            encoder.decode(&bytes),
            Err(Error::MalformedPacket {
                kind: MessageKind::Rev
            })
        ));
    }

    #[test]
    fn test_frame_header() {
        let header = FrameHeader::new(1234).unwrap();
        let parsed = FrameHeader::from_bytes(header.to_bytes()).unwrap();
        assert_eq!(parsed, header);

        let mut bad = header.to_bytes();
        bad[0] ^= 0xFF;
        assert!(matches!(
            FrameHeader::from_bytes(bad),
            Err(Error::InvalidMagicNumber { .. })
        ));

        assert!(FrameHeader::new(MAX_FRAME_LEN + 1).is_err());
    }

    #[tokio::test]
    async fn test_control_channel_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = ControlChannel::new(stream, Arc::new(BincodeEncoder)).unwrap();
            let first = channel.recv().await.unwrap();
            let second = channel.recv().await.unwrap();
            channel.sender().send(Packet::done()).await.unwrap();
            channel.close(Duration::from_secs(1)).await;
            (first, second)
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = ControlChannel::new(stream, Arc::new(BincodeEncoder)).unwrap();
        let sender = channel.sender();
        sender.send(Packet::revision(42)).await.unwrap();
        sender.send(Packet::filename("a.bin")).await.unwrap();
        assert_eq!(channel.recv().await.unwrap(), Packet::done());

        let (first, second) = server.await.unwrap();
        assert_eq!(first, Packet::revision(42));
        assert_eq!(second, Packet::filename("a.bin"));

        // 서버가 닫은 뒤에는 ConnectionClosed
        assert!(matches!(channel.recv().await, Err(Error::ConnectionClosed)));
    }
}
