//! 송신자 (서버측)
//!
//! - 일정 간격으로 원본 블록 스트리밍
//! - 손실률 보고에 따른 전송률 조정
//! - 재전송 요청마다 워커 생성, DONE 시 협조적 중단
//!
//! ```text
//!  streamer ──┐
//!  worker  ───┼─▶ block channel ─▶ pacer (ticker) ─▶ UDP
//!  worker  ───┘                       ▲
//!  control loop ── interval 변경 ─────┘
//! ```

use std::fs::File;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::blockio::read_block;
use crate::codec::Encoder;
use crate::message::{Block, BlockKind, Packet, Retransmit};
use crate::stats::TransferStats;
use crate::transfer::{Progress, ProgressSink};
use crate::config::MAX_BLOCK_RATE;
use crate::{Config, Result};

/// 이 손실률 미만이면 "양호" 보고
pub const LOW_WATER_MARK: f64 = 0.25;

/// 가속에 필요한 연속 양호 보고 수
pub const CONSECUTIVE_INCREASE: u32 = 15;

/// 동시에 실행되는 재전송 워커 상한
pub const MAX_RETRANSMIT_WORKERS: usize = 8;

/// 송신 큐 깊이 (작을수록 스트리머와 워커가 고르게 섞인다)
const BLOCK_QUEUE: usize = 1;

/// 상태 머신 -> 송신 워커 메시지
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Retransmit(Retransmit),
    ErrorRate(f64),
    Done,
}

/// 전송률 변경 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateChange {
    Slower,
    Faster,
}

/// 손실률 기반 전송률 조절기
#[derive(Debug, Clone)]
pub struct RateController {
    /// 초당 블록 수
    block_rate: f64,
    threshold: f64,
    slower: (u32, u32),
    faster: (u32, u32),
    good_streak: u32,
}

impl RateController {
    pub fn new(config: &Config) -> Self {
        Self {
            block_rate: config.initial_block_rate().clamp(1.0, MAX_BLOCK_RATE),
            threshold: config.error_threshold(),
            slower: (config.slower_num, config.slower_den),
            faster: (config.faster_num, config.faster_den),
            good_streak: 0,
        }
    }

    pub fn block_rate(&self) -> f64 {
        self.block_rate
    }

    /// 블록 사이 간격
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.block_rate)
    }

    pub fn good_streak(&self) -> u32 {
        self.good_streak
    }

    /// block_rate * den / num, [1, MAX_BLOCK_RATE] 범위 유지
    fn scale(&mut self, (num, den): (u32, u32)) {
        self.block_rate = (self.block_rate * den as f64 / num as f64).clamp(1.0, MAX_BLOCK_RATE);
    }

    /// 보고된 손실률 반영
    ///
    /// 임계값 초과면 SlowerDen/SlowerNum 배로 감속. LOW_WATER_MARK 미만이
    /// CONSECUTIVE_INCREASE번 이어지면 FasterDen/FasterNum 배로 가속.
    /// 유한하지 않은 값은 나쁜 보고로 본다.
    pub fn on_error_rate(&mut self, ratio: f64) -> Option<RateChange> {
        if !ratio.is_finite() || ratio > self.threshold {
            self.scale(self.slower);
            self.good_streak = 0;
            return Some(RateChange::Slower);
        }

        if ratio >= LOW_WATER_MARK {
            self.good_streak = 0;
            return None;
        }

        self.good_streak += 1;
        if self.good_streak < CONSECUTIVE_INCREASE {
            return None;
        }
        self.scale(self.faster);
        self.good_streak = 0;
        Some(RateChange::Faster)
    }
}

/// 파일에서 블록 읽기
struct BlockSource {
    file: File,
    block_size: u64,
    file_size: u64,
    total_blocks: u64,
}

impl BlockSource {
    fn read(&self, number: u64, kind: BlockKind) -> Result<Block> {
        let offset = number * self.block_size;
        let len = (self.file_size - offset).min(self.block_size) as usize;
        let data = read_block(&self.file, offset, len)?;
        Ok(Block::new(number, Bytes::from(data), kind))
    }
}

/// 블록을 큐에 넣는다. 중단 신호나 큐 종료 시 false.
async fn enqueue(
    source: &BlockSource,
    number: u64,
    kind: BlockKind,
    queue: &mpsc::Sender<Block>,
    stop: &watch::Receiver<bool>,
) -> bool {
    if *stop.borrow() {
        return false;
    }
    // 범위 밖 번호는 건너뛴다
    if number >= source.total_blocks {
        return true;
    }
    match source.read(number, kind) {
        Ok(block) => queue.send(block).await.is_ok(),
        Err(e) => {
            warn!("블록 {} 읽기 실패: {}", number, e);
            false
        }
    }
}

/// 재전송 요청 하나 처리
async fn serve_retransmit(
    retransmit: Retransmit,
    source: Arc<BlockSource>,
    queue: mpsc::Sender<Block>,
    stop: watch::Receiver<bool>,
) {
    if retransmit.is_restart {
        let from = retransmit.block_nums.first().copied().unwrap_or(0);
        debug!("restart: block {}부터", from);
        for number in from..source.total_blocks {
            if !enqueue(&source, number, BlockKind::Original, &queue, &stop).await {
                return;
            }
        }
    } else {
        trace!("재전송: {} blocks", retransmit.block_nums.len());
        for number in retransmit.block_nums {
            if !enqueue(&source, number, BlockKind::Retransmitted, &queue, &stop).await {
                return;
            }
        }
    }
}

/// 페이서: 틱마다 블록 하나를 UDP로 내보낸다
async fn pace(
    socket: UdpSocket,
    encoder: Arc<dyn Encoder>,
    mut blocks: mpsc::Receiver<Block>,
    mut intervals: watch::Receiver<Duration>,
    mut stop: watch::Receiver<bool>,
    stats: Arc<RwLock<TransferStats>>,
) {
    let new_ticker = |period: Duration| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    };
    let mut ticker = new_ticker(*intervals.borrow_and_update());

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            Ok(()) = intervals.changed() => {
                let period = *intervals.borrow_and_update();
                debug!("송신 간격 변경: {:?}", period);
                ticker = new_ticker(period);
            }

            block = blocks.recv() => {
                let Some(block) = block else { break };
                ticker.tick().await;
                if *stop.borrow() {
                    break;
                }

                let kind = block.kind;
                let len = block.data.len() as u64;
                let bytes = match encoder.encode(&Packet::data(block)) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("블록 인코딩 실패: {}", e);
                        continue;
                    }
                };
                if let Err(e) = socket.send(&bytes).await {
                    debug!("블록 전송 실패: {}", e);
                    continue;
                }

                let mut stats = stats.write();
                stats.bytes_sent += len;
                match kind {
                    BlockKind::Original => stats.original_blocks_sent += 1,
                    BlockKind::Retransmitted => stats.retransmitted_blocks_sent += 1,
                }
            }
        }
    }
    trace!("페이서 종료");
}

/// 파일 송신 워커 (연결당 하나)
pub struct FileSender {
    config: Config,
    path: PathBuf,
    target: SocketAddr,
    encoder: Arc<dyn Encoder>,
    progress: ProgressSink,
}

impl FileSender {
    pub fn new(
        config: Config,
        path: impl Into<PathBuf>,
        target: SocketAddr,
        encoder: Arc<dyn Encoder>,
        progress: ProgressSink,
    ) -> Self {
        Self {
            config,
            path: path.into(),
            target,
            encoder,
            progress,
        }
    }

    /// DONE을 받거나 컨트롤 채널이 닫힐 때까지 전송
    ///
    /// 반환 전에 모든 재전송 워커와 페이서가 끝나 있으며,
    /// DONE 이후로는 어떤 블록도 전송되지 않는다.
    pub async fn run(self, mut control: mpsc::Receiver<ControlMessage>) -> Result<TransferStats> {
        let file = File::open(&self.path)?;
        let file_size = file.metadata()?.len();
        let total_blocks = self.config.total_blocks(file_size);
        let source = Arc::new(BlockSource {
            file,
            block_size: self.config.block_size as u64,
            file_size,
            total_blocks,
        });

        let bind_addr: SocketAddr = if self.target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.target).await?;

        let mut rate = RateController::new(&self.config);
        info!(
            "송신 시작: {} -> {}, {} blocks, {:.0} blocks/s",
            self.path.display(),
            self.target,
            total_blocks,
            rate.block_rate()
        );

        let stats = Arc::new(RwLock::new(TransferStats::new(file_size, total_blocks)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (interval_tx, interval_rx) = watch::channel(rate.interval());
        let (queue_tx, queue_rx) = mpsc::channel::<Block>(BLOCK_QUEUE);

        let pacer = tokio::spawn(pace(
            socket,
            self.encoder.clone(),
            queue_rx,
            interval_rx,
            stop_rx.clone(),
            stats.clone(),
        ));

        let streamer = {
            let source = source.clone();
            let queue = queue_tx.clone();
            let stop = stop_rx.clone();
            tokio::spawn(async move {
                for number in 0..source.total_blocks {
                    if !enqueue(&source, number, BlockKind::Original, &queue, &stop).await {
                        break;
                    }
                }
                debug!("원본 스트리밍 종료");
            })
        };

        let permits = Arc::new(Semaphore::new(MAX_RETRANSMIT_WORKERS));
        let mut workers = JoinSet::new();

        while let Some(message) = control.recv().await {
            match message {
                ControlMessage::Retransmit(retransmit) => {
                    {
                        let mut stats = stats.write();
                        if retransmit.is_restart {
                            stats.restart_requests += 1;
                        } else {
                            stats.retransmit_requests += 1;
                        }
                    }
                    let permits = permits.clone();
                    let source = source.clone();
                    let queue = queue_tx.clone();
                    let stop = stop_rx.clone();
                    workers.spawn(async move {
                        // 세마포어가 닫혔으면 이미 종료 중
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        serve_retransmit(retransmit, source, queue, stop).await;
                    });
                }
                ControlMessage::ErrorRate(ratio) => {
                    let change = rate.on_error_rate(ratio);
                    let mut stats = stats.write();
                    stats.last_error_rate = ratio;
                    match change {
                        Some(RateChange::Slower) => stats.slowdowns += 1,
                        Some(RateChange::Faster) => stats.speedups += 1,
                        None => continue,
                    }
                    drop(stats);
                    debug!(
                        "전송률 {:?}: loss={:.3}, {:.1} blocks/s",
                        change,
                        ratio,
                        rate.block_rate()
                    );
                    let _ = interval_tx.send(rate.interval());
                }
                ControlMessage::Done => {
                    debug!("DONE 수신, 송신 종료");
                    break;
                }
            }
        }

        // 중단 신호 -> 워커 합류 -> 자원 해제
        let _ = stop_tx.send(true);
        permits.close();
        drop(queue_tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("재전송 워커 비정상 종료: {}", e);
            }
        }
        if let Err(e) = streamer.await {
            warn!("스트리머 비정상 종료: {}", e);
        }
        if let Err(e) = pacer.await {
            warn!("페이서 비정상 종료: {}", e);
        }

        let stats = stats.read().clone();
        info!("송신 완료: {}", stats.summary());
        self.progress
            .publish(Progress::transferring("Transfer complete", 1.0));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeEncoder;
    use crate::message::Payload;

    #[test]
    fn test_slowdown_factor() {
        let config = Config::default();
        let mut rate = RateController::new(&config);
        assert_eq!(rate.block_rate(), 91.0);

        // 0.80 > 0.75
        assert_eq!(rate.on_error_rate(0.80), Some(RateChange::Slower));
        assert!((rate.block_rate() - 91.0 * 24.0 / 25.0).abs() < 1e-9);

        // 임계값 이하 (양호하지는 않음)
        assert_eq!(rate.on_error_rate(0.5), None);
        assert_eq!(rate.good_streak(), 0);
    }

    #[test]
    fn test_speedup_after_consecutive_good_reports() {
        let mut rate = RateController::new(&Config::default());
        let start = rate.block_rate();

        for _ in 0..CONSECUTIVE_INCREASE - 1 {
            assert_eq!(rate.on_error_rate(0.01), None);
        }
        assert_eq!(rate.on_error_rate(0.0), Some(RateChange::Faster));
        assert!((rate.block_rate() - start * 6.0 / 5.0).abs() < 1e-9);
        assert_eq!(rate.good_streak(), 0);

        // 중간에 나쁜 보고가 끼면 다시 처음부터
        for _ in 0..CONSECUTIVE_INCREASE - 1 {
            rate.on_error_rate(0.0);
        }
        assert_eq!(rate.on_error_rate(0.3), None);
        assert_eq!(rate.on_error_rate(0.0), None);
        assert_eq!(rate.good_streak(), 1);
    }

    #[test]
    fn test_rate_never_drops_below_one_block() {
        let config = Config {
            transfer_rate: 8,
            slower_num: 2,
            slower_den: 1,
            ..Config::default()
        };
        let mut rate = RateController::new(&config);
        rate.on_error_rate(1.0);
        assert_eq!(rate.block_rate(), 1.0);
        assert_eq!(rate.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_rate_is_capped() {
        // 잘못된 설정이 그대로 들어와도 간격은 0이 아니다
        let config = Config {
            transfer_rate: u64::MAX,
            block_size: 1,
            ..Config::default()
        };
        let rate = RateController::new(&config);
        assert_eq!(rate.block_rate(), MAX_BLOCK_RATE);
        assert!(rate.interval() > Duration::ZERO);

        // 손실 없는 링크에서 가속이 계속 쌓여도 상한에서 멈춘다
        let mut rate = RateController::new(&Config::lan());
        for _ in 0..CONSECUTIVE_INCREASE * 2000 {
            rate.on_error_rate(0.0);
        }
        assert_eq!(rate.block_rate(), MAX_BLOCK_RATE);
        assert!(rate.interval() > Duration::ZERO);
        assert!(rate.interval() <= Duration::from_micros(1));
    }

    #[test]
    fn test_non_finite_report_slows_down() {
        let mut rate = RateController::new(&Config::default());
        for _ in 0..CONSECUTIVE_INCREASE - 1 {
            rate.on_error_rate(0.0);
        }
        assert_eq!(rate.on_error_rate(f64::NAN), Some(RateChange::Slower));
        assert_eq!(rate.good_streak(), 0);
        assert!(rate.block_rate() < 91.0);

        assert_eq!(rate.on_error_rate(f64::INFINITY), Some(RateChange::Slower));
    }

    async fn collect_blocks(socket: &UdpSocket, count: usize) -> Vec<Block> {
        let encoder = BincodeEncoder;
        let mut buf = vec![0u8; 4096];
        let mut blocks = Vec::new();
        while blocks.len() < count {
            let len = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            match encoder.decode(&buf[..len]).unwrap().payload {
                Payload::Block(block) => blocks.push(block),
                other => panic!("unexpected payload: {:?}", other),
            }
        }
        blocks
    }

    #[tokio::test]
    async fn test_sender_streams_and_serves_retransmit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        let contents: Vec<u8> = (0..2500u32).map(|i| (i % 199) as u8).collect();
        std::fs::write(&path, &contents).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            transfer_rate: 8 * 1024 * 1000,
            ..Config::default()
        };
        let sender = FileSender::new(
            config,
            &path,
            receiver.local_addr().unwrap(),
            Arc::new(BincodeEncoder),
            ProgressSink::disabled(),
        );
        let (control_tx, control_rx) = mpsc::channel(16);
        let handle = tokio::spawn(sender.run(control_rx));

        let originals = collect_blocks(&receiver, 3).await;
        let numbers: Vec<u64> = originals.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(originals[2].data.len(), 2500 - 2048);
        assert!(originals.iter().all(|b| b.kind == BlockKind::Original));

        control_tx
            .send(ControlMessage::Retransmit(Retransmit::selective(vec![1])))
            .await
            .unwrap();
        let resent = collect_blocks(&receiver, 1).await;
        assert_eq!(resent[0].number, 1);
        assert_eq!(resent[0].kind, BlockKind::Retransmitted);
        assert_eq!(&resent[0].data[..], &contents[1024..2048]);

        control_tx.send(ControlMessage::Done).await.unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.original_blocks_sent, 3);
        assert_eq!(stats.retransmitted_blocks_sent, 1);
        assert_eq!(stats.retransmit_requests, 1);
    }

    #[tokio::test]
    async fn test_done_stops_in_flight_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![1u8; 1024 * 200]).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // 10 blocks/s: DONE 전에 다 보낼 수 없는 속도
        let config = Config {
            transfer_rate: 8 * 1024 * 10,
            ..Config::default()
        };
        let sender = FileSender::new(
            config,
            &path,
            receiver.local_addr().unwrap(),
            Arc::new(BincodeEncoder),
            ProgressSink::disabled(),
        );
        let (control_tx, control_rx) = mpsc::channel(16);
        let handle = tokio::spawn(sender.run(control_rx));

        for _ in 0..3 {
            control_tx
                .send(ControlMessage::Retransmit(Retransmit::restart(0)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        control_tx.send(ControlMessage::Done).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.restart_requests, 3);
        assert!(stats.original_blocks_sent < 200 * 4);

        // DONE 이후 새 블록이 없어야 한다
        let mut buf = vec![0u8; 4096];
        while tokio::time::timeout(Duration::from_millis(50), receiver.recv(&mut buf))
            .await
            .is_ok()
        {}
        assert!(
            tokio::time::timeout(Duration::from_millis(300), receiver.recv(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_slowdown_widens_gap_without_losing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paced.bin");
        std::fs::write(&path, vec![7u8; 1024 * 30]).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // 50 blocks/s, 감속 한 번에 1/4
        let config = Config {
            transfer_rate: 8 * 1024 * 50,
            slower_num: 4,
            slower_den: 1,
            ..Config::default()
        };
        let sender = FileSender::new(
            config,
            &path,
            receiver.local_addr().unwrap(),
            Arc::new(BincodeEncoder),
            ProgressSink::disabled(),
        );
        let (control_tx, control_rx) = mpsc::channel(16);
        let handle = tokio::spawn(sender.run(control_rx));

        let encoder = BincodeEncoder;
        let mut buf = vec![0u8; 4096];
        let mut arrivals = Vec::new();
        while arrivals.len() < 30 {
            if arrivals.len() == 6 {
                control_tx
                    .send(ControlMessage::ErrorRate(0.9))
                    .await
                    .unwrap();
            }
            let len = tokio::time::timeout(Duration::from_secs(5), receiver.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let at = Instant::now();
            match encoder.decode(&buf[..len]).unwrap().payload {
                Payload::Block(block) => arrivals.push((block.number, block.kind, at)),
                other => panic!("unexpected payload: {:?}", other),
            }
        }

        let numbers: Vec<u64> = arrivals.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(numbers, (0..30).collect::<Vec<_>>());
        assert!(arrivals.iter().all(|(_, k, _)| *k == BlockKind::Original));

        let mean_gap =
            |from: usize, to: usize| (arrivals[to].2 - arrivals[from].2) / (to - from) as u32;
        let before = mean_gap(0, 5);
        let after = mean_gap(15, 29);
        assert!(
            after > before * 2,
            "gap before {:?}, after {:?}",
            before,
            after
        );

        control_tx.send(ControlMessage::Done).await.unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.slowdowns, 1);
        assert_eq!(stats.original_blocks_sent, 30);
        assert_eq!(stats.retransmitted_blocks_sent, 0);
    }

    #[tokio::test]
    async fn test_oversized_rate_still_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        std::fs::write(&path, vec![3u8; 64]).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            transfer_rate: u64::MAX,
            block_size: 16,
            ..Config::default()
        };
        let sender = FileSender::new(
            config,
            &path,
            receiver.local_addr().unwrap(),
            Arc::new(BincodeEncoder),
            ProgressSink::disabled(),
        );
        let (control_tx, control_rx) = mpsc::channel(16);
        let handle = tokio::spawn(sender.run(control_rx));

        let blocks = collect_blocks(&receiver, 4).await;
        let numbers: Vec<u64> = blocks.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);

        control_tx.send(ControlMessage::Done).await.unwrap();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.original_blocks_sent, 4);
    }
}
