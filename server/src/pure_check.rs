//! Validation of a client's pure-archive report
//!
//! A pure server expects every client to run the same game code archives it
//! does. The client proves this with `cp <serverId> <cgame> <ui> @ <ref...>
//! <encoded>`, where `encoded` folds the per-map checksum feed into the list
//! so an old report cannot be replayed.

use crate::content::PureChecksums;
use shared::pure::encode_count;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PureCheckError {
    #[error("server has no game code archives to compare against")]
    NoMandatoryArchives,

    #[error("report has {0} arguments, at least 6 required")]
    TooShort(usize),

    #[error("cgame checksum mismatch")]
    CgameMismatch,

    #[error("ui checksum mismatch")]
    UiMismatch,

    #[error("missing '@' delimiter")]
    MissingDelimiter,

    #[error("checksum {0} reported twice")]
    Duplicate(i32),

    #[error("checksum {0} is not loaded on the server")]
    NotLoaded(i32),

    #[error("encoded count mismatch (expected {expected}, got {got})")]
    Parity { expected: i32, got: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PureVerdict {
    /// Report belongs to an earlier checksum feed and is ignored
    Outdated,
    Valid,
    Invalid(PureCheckError),
}

/// Numeric argument the way the C library reads it: garbage is zero
fn atoi(arg: &str) -> i32 {
    let trimmed = arg.trim();
    let end = trimmed
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().unwrap_or(0)
}

/// Checks a tokenized `cp` command
pub fn verify_report(
    args: &[String],
    sums: Option<&PureChecksums>,
    checksum_feed: i32,
    feed_server_id: i32,
) -> PureVerdict {
    match args.get(1) {
        Some(server_id) if atoi(server_id) < feed_server_id => return PureVerdict::Outdated,
        Some(_) => {}
        None => return PureVerdict::Invalid(PureCheckError::TooShort(args.len())),
    }

    match check(args, sums, checksum_feed) {
        Ok(()) => PureVerdict::Valid,
        Err(e) => PureVerdict::Invalid(e),
    }
}

fn check(
    args: &[String],
    sums: Option<&PureChecksums>,
    checksum_feed: i32,
) -> Result<(), PureCheckError> {
    let sums = sums.ok_or(PureCheckError::NoMandatoryArchives)?;

    if args.len() < 6 {
        return Err(PureCheckError::TooShort(args.len()));
    }

    if args[2].starts_with('@') || atoi(&args[2]) != sums.cgame {
        return Err(PureCheckError::CgameMismatch);
    }
    if args[3].starts_with('@') || atoi(&args[3]) != sums.ui {
        return Err(PureCheckError::UiMismatch);
    }
    if !args[4].starts_with('@') {
        return Err(PureCheckError::MissingDelimiter);
    }

    let values: Vec<i32> = args[5..].iter().map(|a| atoi(a)).collect();
    let (encoded, referenced) = match values.split_last() {
        Some((encoded, referenced)) => (*encoded, referenced),
        None => return Err(PureCheckError::TooShort(args.len())),
    };

    for (i, checksum) in referenced.iter().enumerate() {
        if referenced[i + 1..].contains(checksum) {
            return Err(PureCheckError::Duplicate(*checksum));
        }
    }

    if let Some(missing) = referenced.iter().find(|c| !sums.loaded.contains(c)) {
        return Err(PureCheckError::NotLoaded(*missing));
    }

    let expected = encode_count(referenced, checksum_feed);
    if expected != encoded {
        return Err(PureCheckError::Parity {
            expected,
            got: encoded,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::command::tokenize;
    use shared::pure::pure_report;

    fn sums() -> PureChecksums {
        PureChecksums {
            cgame: 111,
            ui: 222,
            loaded: vec![111, 222, 333, 444],
        }
    }

    #[test]
    fn test_matching_report_is_valid() {
        let report = pure_report(10, 111, 222, &[111, 222, 333], 9876);
        let verdict = verify_report(&tokenize(&report), Some(&sums()), 9876, 10);
        assert_eq!(verdict, PureVerdict::Valid);
    }

    #[test]
    fn test_report_from_previous_feed_is_ignored() {
        let report = pure_report(3, 111, 222, &[111], 9876);
        let verdict = verify_report(&tokenize(&report), Some(&sums()), 9876, 10);
        assert_eq!(verdict, PureVerdict::Outdated);
    }

    #[test]
    fn test_rejections() {
        let cases = [
            (pure_report(10, 999, 222, &[111], 1), PureCheckError::CgameMismatch),
            (pure_report(10, 111, 999, &[111], 1), PureCheckError::UiMismatch),
            (pure_report(10, 111, 222, &[111, 111], 1), PureCheckError::Duplicate(111)),
            (pure_report(10, 111, 222, &[555], 1), PureCheckError::NotLoaded(555)),
        ];
        for (report, expected) in cases {
            let verdict = verify_report(&tokenize(&report), Some(&sums()), 1, 10);
            assert_eq!(verdict, PureVerdict::Invalid(expected), "{}", report);
        }
    }

    #[test]
    fn test_wrong_feed_fails_parity() {
        let report = pure_report(10, 111, 222, &[111, 333], 1234);
        let verdict = verify_report(&tokenize(&report), Some(&sums()), 4321, 10);
        assert!(matches!(
            verdict,
            PureVerdict::Invalid(PureCheckError::Parity { .. })
        ));
    }

    #[test]
    fn test_short_report_and_missing_delimiter() {
        let verdict = verify_report(&tokenize("cp 10 111 222 @"), Some(&sums()), 0, 10);
        assert_eq!(verdict, PureVerdict::Invalid(PureCheckError::TooShort(5)));

        let verdict = verify_report(&tokenize("cp 10 111 222 x 5"), Some(&sums()), 0, 10);
        assert_eq!(
            verdict,
            PureVerdict::Invalid(PureCheckError::MissingDelimiter)
        );
    }

    #[test]
    fn test_server_without_game_archives_rejects() {
        let report = pure_report(10, 111, 222, &[], 0);
        assert_eq!(
            verify_report(&tokenize(&report), None, 0, 10),
            PureVerdict::Invalid(PureCheckError::NoMandatoryArchives)
        );
    }

    #[test]
    fn test_atoi_semantics() {
        assert_eq!(atoi("42"), 42);
        assert_eq!(atoi("-7x"), -7);
        assert_eq!(atoi("abc"), 0);
    }
}
