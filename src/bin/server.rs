//! PRL 에코 서버
//!
//! 첫 번째로 데이터그램을 보낸 클라이언트와 연결하고, 받은 메시지를 같은 QoS로 되돌려 보낸다.
//!
//! 사용법:
//!   cargo run --release --bin prl-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 에코
//!   cargo run --release --bin prl-server -- --bind 0.0.0.0:9000
//!
//!   # 압축 + 암호화
//!   cargo run --release --bin prl-server -- --compress --key <64자리 hex>

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use prl::{ChaChaCipher, Config, Endpoint, Priority, QosProfile, ReliabilityClass, UdpTransport, ZstdCompressor};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    compress: bool,
    key: Option<Vec<u8>>,
    verbose: bool,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            compress: false,
            key: None,
            verbose: false,
            config: Config::default(),
        }
    }
}

/// 옵션 값 파싱. 실패하면 사용법 에러로 종료
fn value<T: FromStr>(args: &[String], i: usize, name: &str) -> T {
    match args.get(i + 1).map(|raw| raw.parse()) {
        Some(Ok(value)) => value,
        _ => {
            eprintln!("{} 옵션에 유효한 값이 필요함", name);
            std::process::exit(2);
        }
    }
}

/// 64자리 hex 문자열을 32바이트 키로
fn parse_key(hex: &str) -> Option<Vec<u8>> {
    // 바이트 단위로 자르므로 ASCII 16진수만 허용
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                config.bind_addr = value(&args, i, "--bind");
                i += 1;
            }
            "--fragment-size" => {
                config.config.fragment_size = value(&args, i, "--fragment-size");
                i += 1;
            }
            "--resend-timeout" => {
                config.config.resend_timeout_ms = value(&args, i, "--resend-timeout");
                i += 1;
            }
            "--compress" | "-c" => {
                config.compress = true;
            }
            "--key" | "-k" => {
                let raw: String = value(&args, i, "--key");
                match parse_key(&raw) {
                    Some(key) => config.key = Some(key),
                    None => {
                        eprintln!("--key 는 64자리 hex 문자열이어야 함");
                        std::process::exit(2);
                    }
                }
                i += 1;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"PRL Server - Priority Reliable Link 에코 서버

첫 클라이언트와 연결하고 받은 메시지를 그대로 되돌려 보냄

사용법:
  cargo run --release --bin prl-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:9000)
  --fragment-size <SIZE>    프래그먼트 크기 바이트 (기본: 1200)
  --resend-timeout <MS>     재전송 간격 (기본: 100)
  -c, --compress            zstd 압축 사용
  -k, --key <HEX>           ChaCha20-Poly1305 키 (64자리 hex)
  -v, --verbose             DEBUG 로그
  -h, --help                이 도움말 출력
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
    let server_config = parse_args();

    // 로깅 설정
    let level = if server_config.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    server_config.config.validate()?;

    info!("PRL Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Fragment size: {} bytes", server_config.config.fragment_size);
    info!("Compression: {}", server_config.compress);
    info!("Encryption: {}", server_config.key.is_some());

    let socket = UdpSocket::bind(server_config.bind_addr).await?;
    info!("Waiting for client...");

    // 첫 데이터그램의 주소로 연결 (데이터그램은 큐에 남겨둠)
    let mut peek = vec![0u8; server_config.config.buffer_size];
    let (_, peer) = socket.peek_from(&mut peek).await?;
    socket.connect(peer).await?;
    info!("Client connected: {}", peer);

    let transport = UdpTransport::from_socket(socket, server_config.config.buffer_size);
    let mut endpoint = Endpoint::new(&server_config.config, transport)?;
    if server_config.compress {
        endpoint = endpoint.with_compressor(Arc::new(ZstdCompressor::from_config(&server_config.config)));
    }
    if let Some(key) = &server_config.key {
        endpoint = endpoint.with_cipher(Arc::new(ChaChaCipher::new()), key)?;
    }

    let echo_qos = QosProfile {
        use_compression: server_config.compress,
        use_encryption: server_config.key.is_some(),
        ..QosProfile::plain(Priority::High, ReliabilityClass::Reliable)
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    let stats_interval = Duration::from_millis(server_config.config.stats_interval_ms);
    let mut last_report = Instant::now();
    let mut echoed = 0u64;

    loop {
        tokio::select! {
            result = endpoint.transport().readable() => result?,
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let now = Instant::now();
        let outcome = endpoint.poll(now)?;
        if outcome.frames_received > 0 {
            debug!("poll: {:?}", outcome);
        }

        for message in endpoint.drain_received() {
            endpoint.send(&message, &echo_qos)?;
            echoed += 1;
        }

        for event in endpoint.events().drain() {
            debug!("event: {:?}", event);
        }

        if now.duration_since(last_report) >= stats_interval {
            let stats = endpoint.stats();
            info!("Echoed: {} | {}", echoed, stats.channel.summary());
            last_report = now;
        }
    }

    info!("Shutting down");
    endpoint.close();
    Ok(())
}
