//! NAMI 서버 (송신자)
//!
//! 지정한 디렉터리의 파일을 요청한 클라이언트에게 보낸다.
//! - TCP 컨트롤 채널에서 핸드쉐이크와 재전송 요청 처리
//! - UDP 데이터 채널로 블록 전송, 손실률에 따라 전송률 조정
//!
//! 사용법:
//!   cargo run --release --bin nami-server -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin nami-server -- --bind 0.0.0.0:46224 --dir ./share --secret kitten

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nami::{PeerSettings, ProgressKind, Server, DEFAULT_LISTEN_PORT, PROTOCOL_REVISION};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    directory: PathBuf,
    secret: Option<String>,
    revision: u32,
    verbose_progress: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            directory: PathBuf::from("."),
            secret: std::env::var("NAMI_SECRET").ok(),
            revision: PROTOCOL_REVISION,
            verbose_progress: false,
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
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
            "--progress" | "-p" => {
                config.verbose_progress = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"NAMI Server - TCP 컨트롤 + UDP 데이터 파일 전송 서버

사용법:
  cargo run --release --bin nami-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:46224)
  -d, --dir <PATH>        제공할 파일 디렉터리 (기본: .)
  --secret <SECRET>       공유 비밀 (기본: NAMI_SECRET 환경 변수)
  --revision <N>          프로토콜 리비전 (기본: 20061025)
  -p, --progress          연결별 진행 상황 출력
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => {}
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

    let server_config = parse_args();
    let secret = server_config
        .secret
        .ok_or("공유 비밀 필요: --secret 또는 NAMI_SECRET")?;
    let settings = PeerSettings::new(secret).with_revision(server_config.revision);

    info!("NAMI Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Directory: {}", server_config.directory.display());
    info!("Protocol revision: {}", settings.revision);

    let server = Server::bind(server_config.bind_addr, server_config.directory, settings).await?;

    if server_config.verbose_progress {
        // 진행 상황 소비는 별도 스레드 (프로토콜은 기다리지 않음)
        let transfers = server.transfers();
        thread::spawn(move || {
            for progress in transfers.iter() {
                thread::spawn(move || {
                    for p in progress.iter() {
                        match p.kind {
                            ProgressKind::Error => eprintln!("[error] {}", p.message),
                            _ => println!("[{:>5.1}%] {}", p.percentage * 100.0, p.message),
                        }
                    }
                });
            }
        });
    }

    server.run().await?;
    Ok(())
}
