//! 프로토콜 설정
//!
//! - [`Config`]: 핸드쉐이크에서 클라이언트가 서버로 보내는 전송 파라미터
//! - [`PeerSettings`]: 프로세스 시작 시 주어지는 공유 비밀과 리비전
//! - [`ReliabilityTuning`]: 수신측 재전송 요청 주기

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_LISTEN_PORT, MAX_BLOCK_SIZE, PROTOCOL_REVISION};

/// 블록 전송률 상한 (blocks/sec). 송신 간격이 0이 되지 않게 막는다.
pub const MAX_BLOCK_RATE: f64 = 1_000_000.0;

/// 전송 설정 (협상 후 전송 동안 불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// 서버 TCP 포트
    pub listen_port: u16,

    /// 전송 속도 (bits/sec)
    pub transfer_rate: u64,

    /// 블록 크기 (바이트)
    pub block_size: u32,

    /// 감속 임계 손실률 (만분율, 7500 = 75%)
    pub error_rate: u32,

    /// 감속 비율 분자
    pub slower_num: u32,

    /// 감속 비율 분모
    pub slower_den: u32,

    /// 가속 비율 분자
    pub faster_num: u32,

    /// 가속 비율 분모
    pub faster_den: u32,

    /// 이 수를 넘는 누락은 개별 요청 대신 restart로 처리
    pub max_missed_length: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            transfer_rate: 750_000, // 750 kbit/s
            block_size: 1024,
            error_rate: 7500,
            slower_num: 25,
            slower_den: 24,
            faster_num: 5,
            faster_den: 6,
            max_missed_length: 4096,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// LAN용 설정
    pub fn lan() -> Self {
        Self {
            transfer_rate: 200_000_000, // 200 Mbit/s
            block_size: 1400,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            transfer_rate: 2_000_000,
            block_size: 1000,
            error_rate: 2500, // 25%
            slower_num: 5,
            slower_den: 4,
            max_missed_length: 1024,
            ..Self::default()
        }
    }

    /// 파일 크기에 대한 총 블록 수 (ceil)
    pub fn total_blocks(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.block_size as u64)
    }

    /// 블록 번호의 파일 오프셋
    pub fn block_offset(&self, block_number: u64) -> u64 {
        block_number * self.block_size as u64
    }

    /// 감속 임계 손실률 (0.0 ~ 1.0)
    pub fn error_threshold(&self) -> f64 {
        self.error_rate as f64 / 10_000.0
    }

    /// 초기 블록 전송률 (blocks/sec), 최소 1
    pub fn initial_block_rate(&self) -> f64 {
        let bytes_per_sec = self.transfer_rate as f64 * 0.125;
        (bytes_per_sec / self.block_size as f64).floor().max(1.0)
    }

    /// 협상된 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be > 0".into()));
        }
        if self.block_size as usize > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "block_size {} exceeds {}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.transfer_rate == 0 {
            return Err(Error::InvalidConfig("transfer_rate must be > 0".into()));
        }
        if self.initial_block_rate() > MAX_BLOCK_RATE {
            return Err(Error::InvalidConfig(format!(
                "transfer_rate {} exceeds {} blocks/s at block_size {}",
                self.transfer_rate, MAX_BLOCK_RATE, self.block_size
            )));
        }
        if [
            self.slower_num,
            self.slower_den,
            self.faster_num,
            self.faster_den,
        ]
        .contains(&0)
        {
            return Err(Error::InvalidConfig(
                "rate adjustment factors must be non-zero".into(),
            ));
        }
        if self.max_missed_length == 0 {
            return Err(Error::InvalidConfig("max_missed_length must be > 0".into()));
        }
        Ok(())
    }
}

/// 프로세스 전역 피어 설정
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// 공유 비밀 (인증용, 암호화 아님)
    pub secret: String,

    /// 프로토콜 리비전 (완전 일치해야 함)
    pub revision: u32,
}

impl PeerSettings {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            revision: PROTOCOL_REVISION,
        }
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }
}

/// 수신측 재전송 요청 타이밍
#[derive(Debug, Clone)]
pub struct ReliabilityTuning {
    /// N 블록마다 재전송 요청 검토
    pub retransmit_iteration: u64,

    /// 재전송 요청 최소 간격
    pub retransmit_time_delta: Duration,

    /// UDP 읽기 타임아웃
    pub read_timeout: Duration,
}

impl Default for ReliabilityTuning {
    fn default() -> Self {
        Self {
            retransmit_iteration: 50,
            retransmit_time_delta: Duration::from_millis(320),
            read_timeout: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_blocks() {
        let config = Config::default();
        assert_eq!(config.total_blocks(0), 0);
        assert_eq!(config.total_blocks(1), 1);
        assert_eq!(config.total_blocks(1024), 1);
        assert_eq!(config.total_blocks(1025), 2);
        assert_eq!(config.total_blocks(10_000), 10);
    }

    #[test]
    fn test_initial_block_rate() {
        // 750000 * 0.125 / 1024 = 91.55
        assert_eq!(Config::default().initial_block_rate(), 91.0);

        let slow = Config {
            transfer_rate: 8,
            ..Config::default()
        };
        assert_eq!(slow.initial_block_rate(), 1.0);
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::lan().validate().is_ok());
        assert!(Config::lossy_network().validate().is_ok());

        let bad = Config {
            block_size: 0,
            ..Config::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));

        let bad = Config {
            block_size: MAX_BLOCK_SIZE as u32 + 1,
            ..Config::default()
        };
        assert!(bad.validate().is_err());

        // 송신 간격이 0이 되는 전송률
        let bad = Config {
            transfer_rate: u64::MAX,
            block_size: 1,
            ..Config::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));

        let bad = Config {
            faster_den: 0,
            ..Config::default()
        };
        assert!(bad.validate().is_err());
    }
}
