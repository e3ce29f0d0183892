//! 컨트롤 채널 상태 머신 구동기
//!
//! 클라이언트와 서버는 같은 구동 루프를 쓰고 상태 테이블만 다르다.
//! 각 상태는 이름이 있는 enum 값이며, 상태별 데이터(challenge 등)는
//! 컨텍스트에 둔다.
//!
//! ```text
//!  recv frame ─▶ decode ─▶ kind 검사 ─▶ on_packet(state, packet)
//!                                            │
//!                            Next(state) ◀───┴───▶ Done / Err (종료)
//! ```

use std::fmt;
use std::future::Future;

use tracing::{debug, warn};

use crate::codec::{ControlChannel, ControlSender};
use crate::message::{MessageKind, Packet};
use crate::{Error, Result};

/// 전이 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    Next(S),
    Done,
}

/// 상태 테이블
pub trait ControlState: Copy + fmt::Debug + Send + Sync + Sized {
    type Context: Send;

    fn name(&self) -> &'static str;

    /// 이 상태에서 받을 수 있는 메시지 타입
    fn expects(&self) -> &'static [MessageKind];

    /// (상태, 패킷) -> 다음 상태
    fn on_packet(
        self,
        packet: Packet,
        control: &ControlSender,
        ctx: &mut Self::Context,
    ) -> impl Future<Output = Result<Transition<Self>>> + Send;
}

/// 페이로드 타입 불일치 에러
pub fn unexpected_payload<S: ControlState>(state: S, packet: &Packet) -> Error {
    warn!(
        "잘못된 페이로드: state={}, kind={:?}, payload={}",
        state.name(),
        packet.kind,
        packet.payload.name()
    );
    Error::UnexpectedPayload {
        state: state.name(),
        kind: packet.kind,
    }
}

/// 종료 상태까지 패킷을 하나씩 읽어 상태 머신에 넣는다
///
/// 읽기/디코딩 실패나 프로토콜 위반은 그대로 반환되며 재시도하지 않는다.
pub async fn run<S: ControlState>(
    initial: S,
    channel: &mut ControlChannel,
    ctx: &mut S::Context,
) -> Result<()> {
    let control = channel.sender();
    let mut state = initial;

    loop {
        let packet = channel.recv().await?;

        if !state.expects().contains(&packet.kind) {
            warn!(
                "예상하지 않은 메시지: state={}, got {:?}",
                state.name(),
                packet.kind
            );
            return Err(Error::UnexpectedMessage {
                state: state.name(),
                got: packet.kind,
            });
        }

        match state.on_packet(packet, &control, ctx).await? {
            Transition::Next(next) => {
                if next.name() != state.name() {
                    debug!("상태 전이: {} -> {}", state.name(), next.name());
                }
                state = next;
            }
            Transition::Done => {
                debug!("상태 머신 종료: {}", state.name());
                return Ok(());
            }
        }
    }
}
