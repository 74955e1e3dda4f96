//! FMTP 송신기
//!
//! 명령행으로 받은 파일을 멀티캐스트 그룹에 제품으로 보내고,
//! 보관 기간 동안 재전송 요청에 응답한다.
//!
//! 사용법:
//!   cargo run --release --bin fmtp-sender -- [OPTIONS] <FILE>...
//!
//! 예시:
//!   cargo run --release --bin fmtp-sender -- -g 239.1.1.1:38800 -l 0.0.0.0:38801 a.grib b.grib

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fmtp::{Config, SenderSession, SessionEvent};

type BoxError = Box<dyn std::error::Error>;

/// 송신기 설정
struct SenderArgs {
    group: SocketAddr,
    interface: Ipv4Addr,
    listen: SocketAddr,
    files: Vec<PathBuf>,
    linger: Duration,
    config: Config,
}

impl Default for SenderArgs {
    fn default() -> Self {
        Self {
            group: SocketAddr::from(([239, 1, 1, 1], 38800)),
            interface: Ipv4Addr::UNSPECIFIED,
            listen: SocketAddr::from(([0, 0, 0, 0], 38801)),
            files: Vec::new(),
            linger: Duration::from_secs(30),
            config: Config::default(),
        }
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

fn parse_args() -> Result<SenderArgs, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SenderArgs::default();

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
            "--listen" | "-l" => {
                parsed.listen = value(&args, i, "주소")?;
                i += 1;
            }
            "--rate" | "-r" => {
                parsed.config.rate_bps = value(&args, i, "숫자")?;
                i += 1;
            }
            "--block-size" => {
                parsed.config.block_size = value(&args, i, "숫자")?;
                i += 1;
            }
            "--retention" => {
                parsed.config.retention_ms = value::<u64>(&args, i, "초")? * 1000;
                i += 1;
            }
            "--linger" => {
                parsed.linger = Duration::from_secs(value(&args, i, "초")?);
                i += 1;
            }
            "--ttl" => {
                parsed.config.multicast_ttl = value(&args, i, "숫자")?;
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"FMTP Sender - 멀티캐스트 제품 송신기

사용법:
  cargo run --release --bin fmtp-sender -- [OPTIONS] <FILE>...

옵션:
  -g, --group <ADDR>     멀티캐스트 그룹 (기본: 239.1.1.1:38800)
  -i, --iface <IPV4>     송신 인터페이스 (기본: 0.0.0.0)
  -l, --listen <ADDR>    재전송 채널 주소 (기본: 0.0.0.0:38801)
  -r, --rate <BPS>       송신 속도 bit/s, 0 = 제한 없음 (기본: 20000000)
  --block-size <BYTES>   블록 크기 (기본: 1400)
  --retention <SECS>     재전송용 보관 시간 (기본: 120)
  --linger <SECS>        마지막 제품 송신 후 재전송 대기 시간 (기본: 30)
  --ttl <N>              멀티캐스트 TTL (기본: 1)
  -h, --help             이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other if other.starts_with('-') => warn!("알 수 없는 옵션 무시: {}", other),
            file => parsed.files.push(PathBuf::from(file)),
        }
        i += 1;
    }

    if parsed.files.is_empty() {
        return Err("보낼 파일이 없습니다 (--help 참고)".into());
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

    info!("FMTP Sender starting...");
    info!("Group: {}", args.group);
    info!("Retransmission listen: {}", args.listen);
    info!("Block size: {} bytes", args.config.block_size);
    info!("Rate: {} bit/s", args.config.rate_bps);

    let (session, mut events) =
        SenderSession::start(args.config, args.group, args.interface, args.listen).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SessionEvent::StateChanged { from, to } = event {
                info!("상태 변경: {} -> {}", from, to);
            }
        }
    });

    for path in &args.files {
        let data = match tokio::fs::read(path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                error!("파일 읽기 실패 {:?}: {}", path, e);
                continue;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match session.send_product(data, Bytes::from(name)).await {
            Ok(id) => info!("{:?} -> 제품 {}", path, id),
            Err(e) => error!("{:?} 송신 실패: {}", path, e),
        }
    }

    info!("재전송 대기 {:?} (Ctrl-C로 종료)", args.linger);
    tokio::select! {
        _ = tokio::time::sleep(args.linger) => {}
        _ = tokio::signal::ctrl_c() => info!("종료 요청"),
    }

    session.shutdown().await;
    info!("{}", session.stats().summary());
    Ok(())
}
