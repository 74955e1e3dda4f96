//! FMTP 수신기
//!
//! 멀티캐스트 그룹에 가입해 완성된 제품을 출력 디렉터리에 파일로 저장한다.
//!
//! 사용법:
//!   cargo run --release --bin fmtp-receiver -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin fmtp-receiver -- -g 239.1.1.1:38800 -s 192.168.1.10:38801 -o ./products

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fmtp::{BopInfo, Config, ProductId, ProductQueue, ReceiverSession, SessionEvent};

type BoxError = Box<dyn std::error::Error>;

/// 수신기 설정
struct ReceiverArgs {
    group: SocketAddr,
    interface: Ipv4Addr,
    sender: SocketAddr,
    output: PathBuf,
    config: Config,
}

impl Default for ReceiverArgs {
    fn default() -> Self {
        Self {
            group: SocketAddr::from(([239, 1, 1, 1], 38800)),
            interface: Ipv4Addr::UNSPECIFIED,
            sender: SocketAddr::from(([127, 0, 0, 1], 38801)),
            output: PathBuf::from("products"),
            config: Config::default(),
        }
    }
}

/// 완성된 제품을 디렉터리에 저장
///
/// 파일 이름은 BOP 메타데이터(송신측 파일 이름)를 쓰고, 없으면 `product-<id>.bin`.
struct DirectoryQueue {
    dir: PathBuf,
}

impl DirectoryQueue {
    fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_name(product_id: ProductId, info: Option<&BopInfo>) -> PathBuf {
        info.and_then(|info| std::str::from_utf8(&info.metadata).ok())
            .and_then(|name| Path::new(name).file_name())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("product-{}.bin", product_id)))
    }
}

impl ProductQueue for DirectoryQueue {
    fn insert(&self, product_id: ProductId, info: Option<&BopInfo>, bytes: Bytes) -> fmtp::Result<()> {
        let path = self.dir.join(Self::file_name(product_id, info));
        // 수신 루프 워커에서 호출된다. 블로킹 쓰기는 런타임에 알린다 (멀티스레드 런타임 필요)
        tokio::task::block_in_place(|| std::fs::write(&path, &bytes))?;
        info!("제품 {} 저장: {:?} ({} bytes)", product_id, path, bytes.len());
        Ok(())
    }

    fn signal_missed(&self, product_id: ProductId) {
        warn!("제품 {} 수신 실패", product_id);
    }
}

fn value<T>(args: &[String], i: usize, what: &str) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = args
        .get(i + 1)
        .ok_or_else(|| format!("{} 값 필요", args[i]))?;
    raw.parse()
        .map_err(|e| format!("유효한 {} 필요 ({}): {}", what, raw, e).into())
}

fn parse_args() -> Result<ReceiverArgs, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ReceiverArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--group" | "-g" => {
                parsed.group = value(&args, i, "주소")?;
                i += 1;
            }
            "--iface" | "-i" => {
                parsed.interface = value(&args, i, "IPv4 주소")?;
                i += 1;
            }
            "--sender" | "-s" => {
                parsed.sender = value(&args, i, "주소")?;
                i += 1;
            }
            "--output" | "-o" => {
                parsed.output = PathBuf::from(value::<String>(&args, i, "경로")?);
                i += 1;
            }
            "--max-size" => {
                parsed.config.max_product_size = value(&args, i, "숫자")?;
                i += 1;
            }
            "--lossy" => {
                parsed.config = Config::lossy_network();
            }
            "--help" | "-h" => {
                println!(
                    r#"FMTP Receiver - 멀티캐스트 제품 수신기

사용법:
  cargo run --release --bin fmtp-receiver -- [OPTIONS]

옵션:
  -g, --group <ADDR>     멀티캐스트 그룹 (기본: 239.1.1.1:38800)
  -i, --iface <IPV4>     수신 인터페이스 (기본: 0.0.0.0)
  -s, --sender <ADDR>    송신기 재전송 채널 주소 (기본: 127.0.0.1:38801)
  -o, --output <DIR>     제품 저장 디렉터리 (기본: ./products)
  --max-size <BYTES>     최대 제품 크기 (기본: 64MiB)
  --lossy                손실이 많은 네트워크용 설정
  -h, --help             이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 인자 무시: {}", other),
        }
        i += 1;
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;

    info!("FMTP Receiver starting...");
    info!("Group: {}", args.group);
    info!("Sender: {}", args.sender);
    info!("Output: {:?}", args.output);

    let queue = Arc::new(DirectoryQueue::new(args.output)?);
    let (session, mut events) =
        ReceiverSession::start(args.config, args.group, args.interface, args.sender, queue).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::ProductComplete { product_id, size, elapsed, .. }) => {
                    info!("제품 {} 완료: {} bytes, {:.2}ms", product_id, size, elapsed.as_secs_f64() * 1000.0);
                }
                Some(SessionEvent::ProductLost { product_id, reason }) => {
                    warn!("제품 {} 손실: {}", product_id, reason);
                }
                Some(SessionEvent::StateChanged { from, to }) => info!("상태 변경: {} -> {}", from, to),
                Some(SessionEvent::Closed) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("종료 요청");
                session.shutdown().await;
            }
        }
    }

    session.wait_closed().await;
    info!("{}", session.stats().summary());
    Ok(())
}
