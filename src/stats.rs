//! 전송 통계

use std::time::{Duration, Instant};

/// 재전송 주기 동안의 손실 집계 (수신측)
#[derive(Debug, Clone, Default)]
pub struct LossWindow {
    /// 구간 내 수신 블록 수
    pub received: u64,

    /// 구간 내 새로 감지된 누락 블록 수
    pub missed: u64,
}

impl LossWindow {
    pub fn record_arrival(&mut self) {
        self.received += 1;
    }

    pub fn record_loss(&mut self, count: u64) {
        self.missed += count;
    }

    /// missed / (missed + received)
    pub fn loss_rate(&self) -> f64 {
        let total = self.missed + self.received;
        if total == 0 {
            return 0.0;
        }
        self.missed as f64 / total as f64
    }

    /// 손실률 반환 후 카운터 리셋
    pub fn take_loss_rate(&mut self) -> f64 {
        let rate = self.loss_rate();
        *self = Self::default();
        rate
    }
}

/// 전체 전송 통계 (송신/수신 공용)
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 파일 크기 (바이트)
    pub file_size: u64,

    /// 총 블록 수
    pub total_blocks: u64,

    /// 송신: 전송한 원본 블록 (restart 포함)
    pub original_blocks_sent: u64,

    /// 송신: 개별 재전송한 블록
    pub retransmitted_blocks_sent: u64,

    /// 전송 바이트 (블록 데이터 기준)
    pub bytes_sent: u64,

    /// 수신: 받은 블록 (중복 포함)
    pub blocks_received: u64,

    /// 수신: 이미 받은 블록
    pub duplicate_blocks: u64,

    /// 수신: CRC 불일치로 버린 블록
    pub corrupt_blocks: u64,

    /// 재전송 요청 수 (selective)
    pub retransmit_requests: u64,

    /// restart 요청 수
    pub restart_requests: u64,

    /// 감속 횟수
    pub slowdowns: u64,

    /// 가속 횟수
    pub speedups: u64,

    /// 마지막 보고된 손실률
    pub last_error_rate: f64,
}

impl TransferStats {
    pub fn new(file_size: u64, total_blocks: u64) -> Self {
        Self {
            start_time: Instant::now(),
            file_size,
            total_blocks,
            original_blocks_sent: 0,
            retransmitted_blocks_sent: 0,
            bytes_sent: 0,
            blocks_received: 0,
            duplicate_blocks: 0,
            corrupt_blocks: 0,
            retransmit_requests: 0,
            restart_requests: 0,
            slowdowns: 0,
            speedups: 0,
            last_error_rate: 0.0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 파일 기준 처리율 (bytes/sec)
    pub fn overall_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.file_size as f64 / elapsed
    }

    /// 송신 블록 중 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        let total = self.original_blocks_sent + self.retransmitted_blocks_sent;
        if total == 0 {
            return 0.0;
        }
        self.retransmitted_blocks_sent as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Blocks: {} | Sent: {}+{} | Received: {} (dup {}, corrupt {}) | Retransmit: {} (restart {}) | Rate: -{} +{} | Throughput: {:.2} MB/s",
            self.elapsed().as_secs_f64(),
            self.total_blocks,
            self.original_blocks_sent,
            self.retransmitted_blocks_sent,
            self.blocks_received,
            self.duplicate_blocks,
            self.corrupt_blocks,
            self.retransmit_requests,
            self.restart_requests,
            self.slowdowns,
            self.speedups,
            self.overall_throughput() / 1_000_000.0,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_window_resets() {
        let mut window = LossWindow::default();
        assert_eq!(window.loss_rate(), 0.0);

        for _ in 0..3 {
            window.record_arrival();
        }
        window.record_loss(1);
        assert_eq!(window.take_loss_rate(), 0.25);

        assert_eq!(window.received, 0);
        assert_eq!(window.missed, 0);
        assert_eq!(window.take_loss_rate(), 0.0);
    }

    #[test]
    fn test_retransmit_ratio() {
        let mut stats = TransferStats::new(10_000, 10);
        stats.original_blocks_sent = 10;
        stats.retransmitted_blocks_sent = 10;
        assert_eq!(stats.retransmit_ratio(), 0.5);
        assert!(stats.summary().contains("Blocks: 10"));
    }
}
