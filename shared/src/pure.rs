//! Client side construction of the pure-archive report (`cp` command)

/// Builds `cp <serverId> <cgame> <ui> @ <ref...> <encoded>`
///
/// `encoded` folds the checksum feed, every referenced checksum and their count
/// together so the server can detect a truncated or padded list.
pub fn pure_report(
    server_id: i32,
    cgame: i32,
    ui: i32,
    referenced: &[i32],
    checksum_feed: i32,
) -> String {
    let mut parts = vec![
        "cp".to_string(),
        server_id.to_string(),
        cgame.to_string(),
        ui.to_string(),
        "@".to_string(),
    ];
    parts.extend(referenced.iter().map(|c| c.to_string()));
    parts.push(encode_count(referenced, checksum_feed).to_string());
    parts.join(" ")
}

/// The parity value that terminates a pure report
pub fn encode_count(referenced: &[i32], checksum_feed: i32) -> i32 {
    let folded = referenced.iter().fold(checksum_feed, |acc, c| acc ^ c);
    folded ^ referenced.len() as i32
}
