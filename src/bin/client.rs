//! PRL 클라이언트
//!
//! 서버(에코)로 메시지를 보내고 되돌아온 메시지 수와 RTT를 보고한다.
//! `--simulate` 를 주면 실제 소켓 대신 프로세스 안의 시뮬레이션 네트워크에서
//! 두 엔드포인트를 돌린다.
//!
//! 사용법:
//!   cargo run --release --bin prl-client -- [OPTIONS]
//!
//! 예시:
//!   # UDP 서버로 100개 전송
//!   cargo run --release --bin prl-client -- --server 127.0.0.1:9000 --count 100
//!
//!   # 10% 손실, 50ms 지연 시뮬레이션
//!   cargo run --release --bin prl-client -- --simulate --loss 0.1 --latency 50 --jitter 10

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use prl::{
    ChaChaCipher, Config, Endpoint, LinkTransport, NetworkConditionProfile, Priority, QosProfile,
    ReliabilityClass, SimNetwork, Transport, UdpTransport, ZstdCompressor,
};

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddr,
    bind_addr: SocketAddr,
    count: usize,
    size: usize,
    interval_ms: u64,
    priority: Priority,
    reliable: bool,
    compress: bool,
    key: Option<Vec<u8>>,
    duration_secs: u64,
    verbose: bool,

    simulate: bool,
    condition: NetworkConditionProfile,

    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            count: 100,
            size: 512,
            interval_ms: 10,
            priority: Priority::Medium,
            reliable: true,
            compress: false,
            key: None,
            duration_secs: 30,
            verbose: false,
            simulate: false,
            condition: NetworkConditionProfile::default(),
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

fn parse_priority(raw: &str) -> Option<Priority> {
    match raw.to_ascii_lowercase().as_str() {
        "critical" | "0" => Some(Priority::Critical),
        "high" | "1" => Some(Priority::High),
        "medium" | "2" => Some(Priority::Medium),
        "low" | "3" => Some(Priority::Low),
        "background" | "4" => Some(Priority::Background),
        _ => None,
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                config.server_addr = value(&args, i, "--server");
                i += 1;
            }
            "--bind" | "-b" => {
                config.bind_addr = value(&args, i, "--bind");
                i += 1;
            }
            "--count" | "-n" => {
                config.count = value(&args, i, "--count");
                i += 1;
            }
            "--size" => {
                config.size = value(&args, i, "--size");
                i += 1;
            }
            "--interval" => {
                config.interval_ms = value(&args, i, "--interval");
                i += 1;
            }
            "--priority" | "-p" => {
                let raw: String = value(&args, i, "--priority");
                match parse_priority(&raw) {
                    Some(priority) => config.priority = priority,
                    None => {
                        eprintln!("알 수 없는 우선순위: {}", raw);
                        std::process::exit(2);
                    }
                }
                i += 1;
            }
            "--unreliable" => {
                config.reliable = false;
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
            "--duration" => {
                config.duration_secs = value(&args, i, "--duration");
                i += 1;
            }
            "--fragment-size" => {
                config.config.fragment_size = value(&args, i, "--fragment-size");
                i += 1;
            }
            "--simulate" => {
                config.simulate = true;
            }
            "--loss" => {
                config.condition.packet_loss = value(&args, i, "--loss");
                i += 1;
            }
            "--latency" => {
                config.condition.latency_ms = value(&args, i, "--latency");
                i += 1;
            }
            "--jitter" => {
                config.condition.jitter_ms = value(&args, i, "--jitter");
                i += 1;
            }
            "--corrupt" => {
                config.condition.corruption_prob = value(&args, i, "--corrupt");
                i += 1;
            }
            "--reorder" => {
                config.condition.reorder_prob = value(&args, i, "--reorder");
                i += 1;
            }
            "--bandwidth" => {
                config.condition.bandwidth_bytes_per_sec = value(&args, i, "--bandwidth");
                i += 1;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"PRL Client - Priority Reliable Link 클라이언트

에코 서버로 메시지를 보내고 왕복 결과를 보고

사용법:
  cargo run --release --bin prl-client -- [OPTIONS]

옵션:
  -s, --server <ADDR>       서버 주소 (기본: 127.0.0.1:9000)
  -b, --bind <ADDR>         로컬 바인드 주소 (기본: 0.0.0.0:0)
  -n, --count <N>           보낼 메시지 수 (기본: 100)
  --size <BYTES>            메시지 크기 (기본: 512)
  --interval <MS>           전송 간격 (기본: 10)
  -p, --priority <P>        critical|high|medium|low|background (기본: medium)
  --unreliable              신뢰성 없이 전송
  -c, --compress            zstd 압축 사용
  -k, --key <HEX>           ChaCha20-Poly1305 키 (64자리 hex)
  --duration <SECS>         최대 실행 시간 (기본: 30)
  --fragment-size <SIZE>    프래그먼트 크기 바이트 (기본: 1200)
  -v, --verbose             DEBUG 로그

시뮬레이션:
  --simulate                프로세스 안의 시뮬레이션 네트워크 사용
  --loss <P>                손실 확률 0.0~1.0
  --latency <MS>            기본 지연
  --jitter <MS>             지연 변동폭
  --corrupt <P>             손상 확률 0.0~1.0
  --reorder <P>             순서 뒤바뀜 확률 0.0~1.0
  --bandwidth <BPS>         대역폭 상한 (bytes/sec)

예시:
  # 로컬 서버로 1000개 전송
  cargo run --release --bin prl-client -- -n 1000 --interval 1

  # 불안정한 네트워크 시뮬레이션
  cargo run --release --bin prl-client -- --simulate --loss 0.1 --latency 80 --jitter 20 --reorder 0.05
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

/// 압축기/암호화기 연결
fn configure<T: Transport>(mut endpoint: Endpoint<T>, client: &ClientConfig) -> prl::Result<Endpoint<T>> {
    if client.compress {
        endpoint = endpoint.with_compressor(Arc::new(ZstdCompressor::from_config(&client.config)));
    }
    if let Some(key) = &client.key {
        endpoint = endpoint.with_cipher(Arc::new(ChaChaCipher::new()), key)?;
    }
    Ok(endpoint)
}

fn qos(client: &ClientConfig) -> QosProfile {
    let reliability = if client.reliable {
        ReliabilityClass::Reliable
    } else {
        ReliabilityClass::Unreliable
    };
    QosProfile {
        use_compression: client.compress,
        use_encryption: client.key.is_some(),
        ..QosProfile::plain(client.priority, reliability)
    }
}

fn payload(seq: usize, size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size.max(8)];
    data[..8].copy_from_slice(&(seq as u64).to_be_bytes());
    for (i, byte) in data.iter_mut().enumerate().skip(8) {
        *byte = (i % 251) as u8;
    }
    data
}

/// 결과 요약
fn report<T: Transport>(endpoint: &Endpoint<T>, sent: usize, echoed: usize, elapsed: Duration) {
    let stats = endpoint.stats();
    info!("Transfer complete!");
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Messages: {} sent, {} echoed ({:.1}%)", sent, echoed, echoed as f64 / sent.max(1) as f64 * 100.0);
    info!("  Channel: {}", stats.channel.summary());
    info!(
        "  Pipeline: prepared={}, fragments={}, delivered={}, dropped={}",
        stats.pipeline.messages_prepared,
        stats.pipeline.fragments_prepared,
        stats.pipeline.messages_delivered,
        stats.pipeline.messages_dropped
    );
    info!(
        "  Scheduler: enqueued={}, rejected={}, expired={}",
        stats.scheduler.enqueued, stats.scheduler.rejected, stats.scheduler.expired
    );
    if let Some(rtt) = endpoint.rtt() {
        info!("  RTT: {:.2}ms", rtt.as_secs_f64() * 1000.0);
    }
}

async fn run_udp(client: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Connecting to {}", client.server_addr);
    let transport =
        UdpTransport::connect(client.bind_addr, client.server_addr, client.config.buffer_size).await?;
    info!("Local address: {}", transport.local_addr()?);

    let endpoint = configure(Endpoint::new(&client.config, transport)?, client)?;
    let qos = qos(client);

    let start = Instant::now();
    let deadline = start + Duration::from_secs(client.duration_secs);
    let interval = Duration::from_millis(client.interval_ms);
    let mut ticker = tokio::time::interval(Duration::from_millis(1));

    let mut sent = 0;
    let mut echoed = 0;
    let mut next_send = start;

    while Instant::now() < deadline {
        tokio::select! {
            result = endpoint.transport().readable() => result?,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        if sent < client.count && now >= next_send {
            endpoint.send(&payload(sent, client.size), &qos)?;
            sent += 1;
            next_send = now + interval;
        }

        endpoint.poll(now)?;
        echoed += endpoint.drain_received().len();

        for event in endpoint.events().drain() {
            debug!("event: {:?}", event);
        }

        if sent == client.count && echoed >= sent {
            break;
        }
        // 비신뢰 전송은 잃어버린 메시지를 1초 이상 기다리지 않음
        if sent == client.count && !client.reliable && now >= next_send + Duration::from_secs(1) {
            break;
        }
    }

    report(&endpoint, sent, echoed, start.elapsed());
    endpoint.close();
    Ok(())
}

/// 시뮬레이션 네트워크에서 클라이언트와 에코 피어를 함께 돌림
fn run_simulated(client: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Simulated network: {:?}", client.condition);

    let network = SimNetwork::new();
    let local = network.create_link(0)?;
    let remote = network.create_link(0)?;
    for link in [&local, &remote] {
        link.set_network_condition(client.condition.clone())?;
        link.enable_simulation(true);
    }

    let local_addr = local.local_addr().ok_or("바인드되지 않은 링크")?;
    let remote_addr = remote.local_addr().ok_or("바인드되지 않은 링크")?;

    let endpoint = configure(
        Endpoint::new(&client.config, LinkTransport::connect(local.clone(), remote_addr)?)?,
        client,
    )?;
    let echo = configure(
        Endpoint::new(&client.config, LinkTransport::connect(remote.clone(), local_addr)?)?,
        client,
    )?;
    let qos = qos(client);

    let start = Instant::now();
    let deadline = start + Duration::from_secs(client.duration_secs);
    let interval = Duration::from_millis(client.interval_ms);

    let mut sent = 0;
    let mut echoed = 0;
    let mut next_send = start;

    while Instant::now() < deadline {
        let now = Instant::now();
        if sent < client.count && now >= next_send {
            endpoint.send(&payload(sent, client.size), &qos)?;
            sent += 1;
            next_send = now + interval;
        }

        endpoint.poll(now)?;
        echo.poll(now)?;
        for message in echo.drain_received() {
            echo.send(&message, &qos)?;
        }
        network.step(now);

        echoed += endpoint.drain_received().len();
        let settled = endpoint.pending_count() == 0 && echo.pending_count() == 0;
        if sent == client.count && settled && now >= next_send {
            break;
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    report(&endpoint, sent, echoed, start.elapsed());

    let link_stats = local.statistics();
    info!("  Link (local): {}", link_stats.summary());
    info!("  Link (remote): {}", remote.statistics().summary());
    if link_stats.corrupted_detected > 0 || remote.statistics().corrupted_detected > 0 {
        warn!("Corrupted packets reached the endpoints");
    }

    endpoint.close();
    echo.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = parse_args();

    // 로깅 설정
    let level = if client.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    client.config.validate()?;
    client.condition.validate()?;

    info!("PRL Client starting...");
    info!("Messages: {} x {} bytes, priority {:?}", client.count, client.size, client.priority);
    info!("Reliable: {}, compression: {}, encryption: {}", client.reliable, client.compress, client.key.is_some());

    if client.simulate {
        run_simulated(&client)
    } else {
        run_udp(&client).await
    }
}
