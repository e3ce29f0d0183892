//! NAMI 클라이언트 (수신자)
//!
//! 서버에 파일을 요청해서 로컬 디렉터리에 저장한다.
//! - 누락 블록은 모아서 재전송 요청, 너무 많으면 restart
//! - 주기적으로 손실률을 보고해서 서버 전송률 조정
//!
//! 사용법:
//!   cargo run --release --bin nami-client -- [OPTIONS] <FILENAME>
//!
//! 예시:
//!   cargo run --release --bin nami-client -- --server 127.0.0.1:46224 --secret kitten data.bin

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nami::{Client, Config, PeerSettings, ProgressKind, DEFAULT_LISTEN_PORT, PROTOCOL_REVISION};

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddr,
    directory: PathBuf,
    filename: Option<String>,
    secret: Option<String>,
    revision: u32,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_LISTEN_PORT)),
            directory: PathBuf::from("."),
            filename: None,
            secret: std::env::var("NAMI_SECRET").ok(),
            revision: PROTOCOL_REVISION,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--dir" | "-d" => {
                if i + 1 < args.len() {
                    config.directory = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--secret" => {
                if i + 1 < args.len() {
                    config.secret = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--revision" => {
                if i + 1 < args.len() {
                    config.revision = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--rate" | "-r" => {
                if i + 1 < args.len() {
                    config.config.transfer_rate = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--block-size" => {
                if i + 1 < args.len() {
                    config.config.block_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--lan" => {
                config.config = Config::lan();
            }
            "--lossy" => {
                config.config = Config::lossy_network();
            }
            "--help" | "-h" => {
                println!(
                    r#"NAMI Client - TCP 컨트롤 + UDP 데이터 파일 전송 클라이언트

사용법:
  cargo run --release --bin nami-client -- [OPTIONS] <FILENAME>

옵션:
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:46224)
  -d, --dir <PATH>        저장 디렉터리 (기본: .)
  --secret <SECRET>       공유 비밀 (기본: NAMI_SECRET 환경 변수)
  --revision <N>          프로토콜 리비전 (기본: 20061025)
  -r, --rate <BITS>       초기 전송률 bits/sec (기본: 750000)
  --block-size <BYTES>    블록 크기 (기본: 1024)
  --lan                   LAN 프리셋 (200 Mbit/s, 1400 바이트 블록)
  --lossy                 불안정 네트워크 프리셋
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => {
                config.filename = Some(other.to_string());
            }
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();
    let filename = client_config
        .filename
        .ok_or("파일명 필요 (--help 참고)")?;
    let secret = client_config
        .secret
        .ok_or("공유 비밀 필요: --secret 또는 NAMI_SECRET")?;
    client_config.config.validate()?;

    let settings = PeerSettings::new(secret).with_revision(client_config.revision);

    info!("NAMI Client starting...");
    info!("Server: {}", client_config.server_addr);
    info!("File: {} -> {}", filename, client_config.directory.display());
    info!(
        "Rate: {} bit/s, block size: {} bytes",
        client_config.config.transfer_rate, client_config.config.block_size
    );

    let client = Client::new(client_config.directory, client_config.config, settings);
    let (progress, handle) = client.get_file(filename, client_config.server_addr);

    // 진행 상황 출력 (수신 측이 대기 중일 때만 전달됨)
    let printer = thread::spawn(move || {
        let mut last_percent = -1i64;
        for p in progress.iter() {
            match p.kind {
                ProgressKind::Error => eprintln!("[error] {}", p.message),
                ProgressKind::Handshaking => println!("[handshake] {}", p.message),
                ProgressKind::Transferring => {
                    let percent = (p.percentage * 100.0) as i64;
                    if percent != last_percent {
                        println!("[{:>3}%] {}", percent, p.message);
                        last_percent = percent;
                    }
                }
            }
        }
    });

    let result = handle.await?;
    let _ = printer.join();

    match result {
        Ok(stats) => {
            info!("완료: {}", stats.summary());
            Ok(())
        }
        Err(e) => {
            error!("전송 실패: {}", e);
            Err(e.into())
        }
    }
}
