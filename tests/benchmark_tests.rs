//! Performance smoke tests for the connection layer hot paths
//!
//! Bounds are generous; they catch accidental quadratic behaviour, not
//! regressions of a few percent.

use rand::rngs::StdRng;
use rand::SeedableRng;
use server::challenge::ChallengeCache;
use server::drdos::InfoReceipts;
use server::reliable::ReliableChannel;
use server::{Collaborators, ServerConfig, ServerContext};
use shared::command::tokenize;
use shared::packet::{
    decode_client_body, encode_client_packet, encode_oob, ClientMessage, ReliableCommand, UserMove,
};
use shared::{InfoString, NetAddr, UserCmd};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

fn remote(a: u8, b: u8, port: u16) -> NetAddr {
    NetAddr::remote(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, a, b)), port))
}

/// Benchmarks the command tokenizer
#[test]
fn benchmark_tokenize() {
    let line = "connect \"\\name\\Some Player\\rate\\25000\\snaps\\20\\cl_guid\\0123456789ABCDEF0123456789ABCDEF\"";
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let args = tokenize(line);
        assert_eq!(args.len(), 2);
    }

    let duration = start.elapsed();
    println!(
        "Tokenize: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks userinfo parsing and updates
#[test]
fn benchmark_infostring() {
    let raw = "\\name\\Player\\rate\\25000\\snaps\\20\\model\\sarge\\handicap\\100";
    let iterations = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        let mut info = InfoString::parse(raw);
        info.set("ip", "198.51.100.7:27960").unwrap();
        info.set("rate", &(i % 90000).to_string()).unwrap();
        assert_eq!(info.value("model"), "sarge");
    }

    let duration = start.elapsed();
    println!("Infostring: {} iterations in {:?}", iterations, duration);

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the client message codec
#[test]
fn benchmark_client_message_codec() {
    let message = ClientMessage {
        server_id: 12345,
        message_acknowledge: 100,
        reliable_acknowledge: 50,
        commands: (1..=8)
            .map(|sequence| ReliableCommand {
                sequence,
                text: format!("nextdl {}", sequence),
            })
            .collect(),
        movement: Some(UserMove {
            delta: true,
            cmds: vec![UserCmd::default(); 3],
        }),
    };

    let iterations = 50_000;
    let start = Instant::now();

    for sequence in 0..iterations {
        let data = encode_client_packet(sequence, 777, &message).unwrap();
        let decoded = decode_client_body(&data).unwrap();
        assert_eq!(decoded.commands.len(), 8);
    }

    let duration = start.elapsed();
    println!(
        "Client codec: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks the reliable command ring under steady acknowledgement
#[test]
fn benchmark_reliable_channel() {
    let mut channel = ReliableChannel::new();
    let iterations = 200_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let sequence = channel.push("print \"tick\"").unwrap();
        channel.set_acknowledge(sequence - 1).unwrap();
        assert!(channel.pending().count() <= 2);
    }

    let duration = start.elapsed();
    println!("Reliable channel: {} iterations in {:?}", iterations, duration);

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the challenge cache when it is full and evicting
#[test]
fn benchmark_challenge_cache_eviction() {
    let mut cache = ChallengeCache::new(1024);
    let mut rng = StdRng::seed_from_u64(9);
    let iterations = 20_000u32;
    let start = Instant::now();

    for i in 0..iterations {
        let addr = remote((i / 250) as u8, (i % 250) as u8, 27960);
        cache.issue(addr, i as u64, &mut rng);
    }

    let duration = start.elapsed();
    println!("Challenge issue: {} addresses in {:?}", iterations, duration);

    assert!(cache.len() <= 1024);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks the reflection guard against a spoofed query flood
#[test]
fn benchmark_info_receipts_flood() {
    let mut receipts = InfoReceipts::new(48);
    let iterations = 100_000u32;
    let start = Instant::now();
    let mut blocked = 0;

    for i in 0..iterations {
        let addr = remote(100, (i % 200) as u8, 27960);
        if receipts.should_block(&addr, i as u64) {
            blocked += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Info receipts: {} queries in {:?}, {} blocked",
        iterations, duration, blocked
    );

    assert!(blocked > 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks full server frames with a busy slot table
#[test]
fn benchmark_server_frames_with_bots() {
    let mut config = ServerConfig::default();
    config.max_clients = 32;
    let mut ctx = ServerContext::new(config, Collaborators::in_memory(), 5);
    for i in 0..24 {
        ctx.add_bot(&format!("bot{}", i)).unwrap();
    }

    let frames = 2_000;
    let start = Instant::now();

    for _ in 0..frames {
        ctx.frame(50);
        ctx.take_outgoing();
    }

    let duration = start.elapsed();
    println!(
        "Server frames: {} frames with 24 bots in {:?} ({:.2} μs/frame)",
        frames,
        duration,
        duration.as_micros() as f64 / frames as f64
    );

    assert_eq!(ctx.clients.bots(), 24);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks the connectionless path with a stream of status queries
#[test]
fn benchmark_connectionless_queries() {
    let mut ctx = ServerContext::new(ServerConfig::default(), Collaborators::in_memory(), 6);
    let iterations = 10_000u32;
    let start = Instant::now();

    for i in 0..iterations {
        let from = remote((i / 250) as u8, (i % 250) as u8, 27960);
        ctx.packet_event(from, &encode_oob("getchallenge"));
        ctx.take_outgoing();
    }

    let duration = start.elapsed();
    println!("Connectionless: {} requests in {:?}", iterations, duration);

    assert!(duration.as_millis() < 3000);
}
