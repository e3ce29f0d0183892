//! 수신자 (클라이언트측 블록 신뢰성 엔진)
//!
//! - 블록 도착 비트맵과 gapless 커서
//! - 누락 감지 및 정렬된 재전송 목록
//! - 누락이 너무 많으면 restart 요청
//!
//! ```text
//!  UDP datagram ─▶ decode/CRC ─▶ BlockTracker::on_block ─▶ 위치 지정 쓰기
//!                                      │
//!                     restart / 주기적 flush ─▶ ERROR_RATE + RETRANSMIT (TCP)
//! ```

use std::fs::File;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::blockio::write_block;
use crate::codec::{ControlSender, Encoder};
use crate::message::{Block, BlockKind, Packet, Payload, Retransmit};
use crate::stats::{LossWindow, TransferStats};
use crate::transfer::{Progress, ProgressSink};
use crate::{Config, ReliabilityTuning, Result};

/// 블록 데이터 외 인코딩 여유분
const DATAGRAM_OVERHEAD: usize = 512;

/// 정렬/중복 없는 목록에 삽입 (이미 있으면 무시)
pub fn insert_ordered(list: &mut Vec<u64>, value: u64) {
    if let Err(pos) = list.binary_search(&value) {
        list.insert(pos, value);
    }
}

/// 블록 하나 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    /// 처음 받은 블록인지
    pub newly_received: bool,

    /// 즉시 보내야 하는 restart 요청
    pub restart: Option<Retransmit>,
}

/// 블록 도착 상태 (소켓/파일과 무관한 순수 상태)
#[derive(Debug)]
pub struct BlockTracker {
    received: Vec<bool>,
    received_count: u64,

    /// 다음에 기대하는 ORIGINAL 블록 번호
    expected_block: u64,

    /// 아직 받지 못한 첫 번째 블록 (이 아래는 모두 수신)
    gapless_to_block: u64,

    /// 재전송 대기 목록 (오름차순)
    pending: Vec<u64>,

    max_missed_length: usize,
    loss: LossWindow,
}

impl BlockTracker {
    pub fn new(total_blocks: u64, max_missed_length: u32) -> Self {
        Self {
            received: vec![false; total_blocks as usize],
            received_count: 0,
            expected_block: 0,
            gapless_to_block: 0,
            pending: Vec::new(),
            max_missed_length: max_missed_length as usize,
            loss: LossWindow::default(),
        }
    }

    pub fn total_blocks(&self) -> u64 {
        self.received.len() as u64
    }

    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    pub fn expected_block(&self) -> u64 {
        self.expected_block
    }

    pub fn gapless_to_block(&self) -> u64 {
        self.gapless_to_block
    }

    pub fn pending(&self) -> &[u64] {
        &self.pending
    }

    pub fn is_received(&self, number: u64) -> bool {
        self.received
            .get(number as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_blocks()
    }

    /// 수신 비율 (0.0 ~ 1.0)
    pub fn fraction(&self) -> f64 {
        if self.received.is_empty() {
            return 1.0;
        }
        self.received_count as f64 / self.received.len() as f64
    }

    /// 블록 도착 처리
    ///
    /// 범위를 벗어난 번호는 호출 전에 걸러야 한다.
    pub fn on_block(&mut self, number: u64, kind: BlockKind) -> BlockOutcome {
        let idx = number as usize;
        let newly_received = idx < self.received.len() && !self.received[idx];
        if newly_received {
            self.received[idx] = true;
            self.received_count += 1;
            self.loss.record_arrival();
        }

        while self.is_received(self.gapless_to_block) {
            self.gapless_to_block += 1;
        }

        let mut restart = None;
        if number > self.expected_block {
            let gap = number - self.expected_block;
            self.loss.record_loss(gap);

            if self.pending.len() as u64 + gap > self.max_missed_length as u64 {
                self.pending.clear();
                if self.gapless_to_block < self.total_blocks() {
                    restart = Some(Retransmit::restart(self.gapless_to_block));
                }
            } else {
                for missing in self.expected_block..number {
                    if !self.is_received(missing) {
                        insert_ordered(&mut self.pending, missing);
                    }
                }
            }
        }

        // 개별 재전송 블록은 기대 커서를 움직이지 않음
        if kind == BlockKind::Original {
            self.expected_block = number + 1;
        }

        BlockOutcome {
            newly_received,
            restart,
        }
    }

    /// 대기 목록에서 이미 받은 블록을 빼고 요청 생성
    ///
    /// 남은 수가 max_missed_length를 넘으면 가장 낮은 번호부터 restart.
    pub fn flush_pending(&mut self) -> Option<Retransmit> {
        let pending = std::mem::take(&mut self.pending);
        let missing: Vec<u64> = pending
            .into_iter()
            .filter(|&n| !self.is_received(n))
            .collect();

        match missing.first() {
            None => None,
            Some(&lowest) if missing.len() > self.max_missed_length => {
                Some(Retransmit::restart(lowest))
            }
            Some(_) => Some(Retransmit::selective(missing)),
        }
    }

    /// 주기적 보고: (구간 손실률, 재전송 요청)
    pub fn take_report(&mut self) -> (f64, Option<Retransmit>) {
        let rate = self.loss.take_loss_rate();
        (rate, self.flush_pending())
    }

    /// 읽기 타임아웃 처리
    ///
    /// 대기 목록이 비어 있으면 gapless 커서부터 restart, 아니면
    /// `[gapless, expected)` 범위의 미수신 블록을 합쳐 개별 요청한다.
    pub fn on_timeout(&mut self) -> Option<Retransmit> {
        if self.is_complete() {
            return None;
        }
        if self.pending.is_empty() {
            return Some(Retransmit::restart(self.gapless_to_block));
        }

        let upper = self.expected_block.min(self.total_blocks());
        for missing in self.gapless_to_block..upper {
            // 한도를 넘으면 어차피 커서부터 restart
            if self.pending.len() > self.max_missed_length {
                break;
            }
            if !self.is_received(missing) {
                insert_ordered(&mut self.pending, missing);
            }
        }
        self.flush_pending()
    }
}

/// UDP 수신 엔진
pub struct Receiver {
    socket: UdpSocket,
    file: File,
    config: Config,
    file_size: u64,
    tracker: BlockTracker,
    control: ControlSender,
    encoder: Arc<dyn Encoder>,
    progress: ProgressSink,
    tuning: ReliabilityTuning,
    stats: TransferStats,
}

impl Receiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: UdpSocket,
        file: File,
        config: Config,
        file_size: u64,
        control: ControlSender,
        encoder: Arc<dyn Encoder>,
        progress: ProgressSink,
        tuning: ReliabilityTuning,
    ) -> Self {
        let total_blocks = config.total_blocks(file_size);
        Self {
            tracker: BlockTracker::new(total_blocks, config.max_missed_length),
            stats: TransferStats::new(file_size, total_blocks),
            socket,
            file,
            config,
            file_size,
            control,
            encoder,
            progress,
            tuning,
        }
    }

    /// 마지막 블록만 짧을 수 있음
    fn expected_len(&self, number: u64) -> usize {
        let offset = self.config.block_offset(number);
        (self.file_size - offset).min(self.config.block_size as u64) as usize
    }

    async fn request(&mut self, retransmit: Retransmit) -> Result<()> {
        if retransmit.is_restart {
            self.stats.restart_requests += 1;
            debug!("restart 요청: from block {}", retransmit.block_nums[0]);
        } else {
            self.stats.retransmit_requests += 1;
            debug!("재전송 요청: {} blocks", retransmit.block_nums.len());
        }
        self.control.send(Packet::retransmit(retransmit)).await
    }

    /// 데이터그램 하나를 검증된 블록으로
    fn decode_block(&mut self, datagram: &[u8]) -> Option<Block> {
        let block = match self.encoder.decode(datagram) {
            Ok(Packet {
                payload: Payload::Block(block),
                ..
            }) => block,
            Ok(packet) => {
                debug!("DATA가 아닌 데이터그램 무시: {:?}", packet.kind);
                return None;
            }
            Err(e) => {
                debug!("데이터그램 디코딩 실패, 버림: {}", e);
                return None;
            }
        };

        if block.number >= self.tracker.total_blocks() {
            debug!("범위 밖 블록 무시: {}", block.number);
            return None;
        }
        if !block.verify_crc() || block.data.len() != self.expected_len(block.number) {
            self.stats.corrupt_blocks += 1;
            debug!("손상된 블록 버림: {}", block.number);
            return None;
        }
        Some(block)
    }

    /// 모든 블록을 받을 때까지 실행
    ///
    /// 완료 시 DONE을 보내고 통계를 반환한다. 손실과 타임아웃은 재전송으로
    /// 복구하며 에러로 올리지 않는다.
    pub async fn run(mut self) -> Result<TransferStats> {
        let total = self.tracker.total_blocks();
        info!(
            "수신 시작: {} bytes, {} blocks, port {}",
            self.file_size,
            total,
            self.socket.local_addr()?.port()
        );

        let mut buf = vec![0u8; self.config.block_size as usize + DATAGRAM_OVERHEAD];
        let mut last_request = Instant::now();

        while !self.tracker.is_complete() {
            let received =
                tokio::time::timeout(self.tuning.read_timeout, self.socket.recv(&mut buf)).await;
            let len = match received {
                Err(_) => {
                    if let Some(retransmit) = self.tracker.on_timeout() {
                        debug!(
                            "읽기 타임아웃: gapless={}, received={}/{}",
                            self.tracker.gapless_to_block(),
                            self.tracker.received_count(),
                            total
                        );
                        self.request(retransmit).await?;
                        last_request = Instant::now();
                    }
                    continue;
                }
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
                    ) =>
                {
                    trace!("일시적 수신 에러 무시: {}", e);
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(len)) => len,
            };

            let Some(block) = self.decode_block(&buf[..len]) else {
                continue;
            };
            self.stats.blocks_received += 1;

            let outcome = self.tracker.on_block(block.number, block.kind);
            if outcome.newly_received {
                write_block(
                    &self.file,
                    self.config.block_offset(block.number),
                    &block.data,
                )?;
            } else {
                self.stats.duplicate_blocks += 1;
            }

            if self.tracker.is_complete() {
                break;
            }

            if let Some(restart) = outcome.restart {
                self.request(restart).await?;
                last_request = Instant::now();
            }

            if outcome.newly_received
                && self.tracker.received_count() % self.tuning.retransmit_iteration == 0
                && last_request.elapsed() > self.tuning.retransmit_time_delta
            {
                let (error_rate, retransmit) = self.tracker.take_report();
                self.stats.last_error_rate = error_rate;
                self.control.send(Packet::error_rate(error_rate)).await?;
                if let Some(retransmit) = retransmit {
                    self.request(retransmit).await?;
                }
                last_request = Instant::now();
            }

            if outcome.newly_received {
                self.progress.publish(Progress::transferring(
                    format!("{}/{} blocks", self.tracker.received_count(), total),
                    self.tracker.fraction(),
                ));
            }
        }

        self.file.sync_all()?;
        self.control.send(Packet::done()).await?;
        self.progress
            .publish(Progress::transferring("Transfer complete", 1.0));
        info!("수신 완료: {}", self.stats.summary());
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::BincodeEncoder;
    use crate::message::MessageKind;

    #[test]
    fn test_insert_ordered() {
        let mut list = Vec::new();
        for value in [5, 1, 9, 5, 3, 1, 7, 9, 0] {
            insert_ordered(&mut list, value);
        }
        assert_eq!(list, vec![0, 1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_dropped_block_is_requested_alone() {
        let mut tracker = BlockTracker::new(10, 4096);
        for n in (0..10).filter(|&n| n != 3) {
            let outcome = tracker.on_block(n, BlockKind::Original);
            assert!(outcome.newly_received);
            assert!(outcome.restart.is_none());
        }

        assert_eq!(tracker.pending(), &[3]);
        assert_eq!(tracker.gapless_to_block(), 3);
        assert!(!tracker.is_complete());

        let (rate, retransmit) = tracker.take_report();
        assert_eq!(rate, 0.1);
        assert_eq!(retransmit, Some(Retransmit::selective(vec![3])));

        let outcome = tracker.on_block(3, BlockKind::Retransmitted);
        assert!(outcome.newly_received);
        assert_eq!(tracker.expected_block(), 10);
        assert_eq!(tracker.gapless_to_block(), 10);
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_large_gap_requests_restart() {
        let mut tracker = BlockTracker::new(6000, 4096);
        tracker.on_block(0, BlockKind::Original);

        let outcome = tracker.on_block(5001, BlockKind::Original);
        assert_eq!(outcome.restart, Some(Retransmit::restart(1)));
        assert!(tracker.pending().is_empty());
        assert_eq!(tracker.expected_block(), 5002);
    }

    #[test]
    fn test_pending_plus_gap_over_limit_restarts() {
        let mut tracker = BlockTracker::new(100, 4);
        tracker.on_block(0, BlockKind::Original);
        tracker.on_block(3, BlockKind::Original);
        assert_eq!(tracker.pending(), &[1, 2]);

        // 2 + 3 > 4
        let outcome = tracker.on_block(7, BlockKind::Original);
        assert_eq!(outcome.restart, Some(Retransmit::restart(1)));
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn test_retransmitted_block_keeps_cursor() {
        let mut tracker = BlockTracker::new(20, 4096);
        tracker.on_block(0, BlockKind::Original);
        tracker.on_block(5, BlockKind::Original);
        assert_eq!(tracker.expected_block(), 6);

        tracker.on_block(2, BlockKind::Retransmitted);
        assert_eq!(tracker.expected_block(), 6);
        assert_eq!(tracker.gapless_to_block(), 1);

        // 이미 받은 블록은 목록에서 빠진다
        assert_eq!(
            tracker.flush_pending(),
            Some(Retransmit::selective(vec![1, 3, 4]))
        );
        assert_eq!(tracker.flush_pending(), None);
    }

    #[test]
    fn test_gapless_cursor_is_monotonic() {
        let mut tracker = BlockTracker::new(64, 4096);
        let order = [7u64, 0, 3, 1, 2, 63, 5, 4, 6, 8, 2, 0, 40, 9, 10];
        let mut previous = 0;

        for n in order {
            tracker.on_block(n, BlockKind::Original);
            let cursor = tracker.gapless_to_block();
            assert!(cursor >= previous);
            assert!((0..cursor).all(|i| tracker.is_received(i)));
            assert!(!tracker.is_received(cursor));
            previous = cursor;
        }
        assert_eq!(tracker.gapless_to_block(), 11);
    }

    #[test]
    fn test_oversized_flush_collapses_to_restart() {
        let mut tracker = BlockTracker::new(100, 4);
        tracker.on_block(0, BlockKind::Original);
        tracker.on_block(3, BlockKind::Original);
        assert_eq!(tracker.take_report().1, Some(Retransmit::selective(vec![1, 2])));

        tracker.on_block(8, BlockKind::Original);
        assert_eq!(tracker.pending(), &[4, 5, 6, 7]);

        // [1, 9) 중 미수신 블록을 합치면 한도를 넘는다
        assert_eq!(tracker.on_timeout(), Some(Retransmit::restart(1)));

        let mut tracker = BlockTracker::new(3, 1);
        tracker.on_block(0, BlockKind::Original);
        tracker.pending = vec![1, 2];
        assert_eq!(tracker.flush_pending(), Some(Retransmit::restart(1)));
    }

    #[test]
    fn test_timeout_without_pending_restarts_from_cursor() {
        let mut tracker = BlockTracker::new(10, 4096);
        for n in 0..4 {
            tracker.on_block(n, BlockKind::Original);
        }
        assert_eq!(tracker.on_timeout(), Some(Retransmit::restart(4)));

        let mut done = BlockTracker::new(1, 4096);
        done.on_block(0, BlockKind::Original);
        assert_eq!(done.on_timeout(), None);
        assert!(BlockTracker::new(0, 4096).is_complete());
    }

    async fn next_control(rx: &mut mpsc::Receiver<Packet>, kind: MessageKind) -> Packet {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if packet.kind == kind {
                return packet;
            }
        }
    }

    #[tokio::test]
    async fn test_receiver_recovers_dropped_block() {
        let config = Config::default();
        let contents: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let file_size = contents.len() as u64;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = File::create(&path).unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::channel(64);
        let tuning = ReliabilityTuning {
            read_timeout: Duration::from_millis(100),
            ..ReliabilityTuning::default()
        };

        let encoder: Arc<dyn Encoder> = Arc::new(BincodeEncoder);
        let receiver = Receiver::new(
            socket,
            file,
            config.clone(),
            file_size,
            ControlSender::from_channel(tx),
            encoder.clone(),
            ProgressSink::disabled(),
            tuning,
        );
        let handle = tokio::spawn(receiver.run());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(("127.0.0.1", port)).await.unwrap();
        let send = |n: u64, kind: BlockKind| {
            let start = config.block_offset(n) as usize;
            let end = (start + config.block_size as usize).min(contents.len());
            let block = Block::new(n, Bytes::copy_from_slice(&contents[start..end]), kind);
            encoder.encode(&Packet::data(block)).unwrap()
        };

        for n in (0..10).filter(|&n| n != 3) {
            peer.send(&send(n, BlockKind::Original)).await.unwrap();
        }

        let request = loop {
            let packet = next_control(&mut rx, MessageKind::Retransmit).await;
            match packet.payload {
                Payload::Retransmit(r) if !r.is_restart => break r,
                _ => continue,
            }
        };
        assert_eq!(request, Retransmit::selective(vec![3]));

        peer.send(&send(3, BlockKind::Retransmitted)).await.unwrap();
        next_control(&mut rx, MessageKind::Done).await;

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.total_blocks, 10);
        assert!(stats.retransmit_requests >= 1);
        assert_eq!(std::fs::read(&path).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_empty_file_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("empty")).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        let receiver = Receiver::new(
            socket,
            file,
            Config::default(),
            0,
            ControlSender::from_channel(tx),
            Arc::new(BincodeEncoder),
            ProgressSink::disabled(),
            ReliabilityTuning::default(),
        );
        let stats = receiver.run().await.unwrap();
        assert_eq!(stats.total_blocks, 0);
        assert_eq!(rx.recv().await, Some(Packet::done()));
    }
}
