//! 에러 타입 정의

use thiserror::Error;

use crate::message::MessageKind;

/// NAMI 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("프로토콜 리비전 불일치: expected {expected}, got {got}")]
    RevisionMismatch { expected: u32, got: u32 },

    #[error("인증 실패")]
    AuthenticationFailed,

    #[error("파일 없음: {0}")]
    FileNotFound(String),

    #[error("메시지 타입 불일치: state={state}, got {got:?}")]
    UnexpectedMessage { state: &'static str, got: MessageKind },

    #[error("페이로드 타입 불일치: state={state}, kind={kind:?}")]
    UnexpectedPayload {
        state: &'static str,
        kind: MessageKind,
    },

    #[error("잘못된 패킷: kind={kind:?}")]
    MalformedPacket { kind: MessageKind },

    #[error("프레임 크기 초과: {size} > {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 프로토콜 위반 여부 (재시도 없이 연결 종료 대상)
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::RevisionMismatch { .. }
                | Error::AuthenticationFailed
                | Error::FileNotFound(_)
                | Error::UnexpectedMessage { .. }
                | Error::UnexpectedPayload { .. }
                | Error::MalformedPacket { .. }
                | Error::InvalidConfig(_)
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
