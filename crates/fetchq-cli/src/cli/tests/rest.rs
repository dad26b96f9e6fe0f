//! Tests for status, pause, resume, cancel, remove, report, checksum.

use super::parse;
use crate::cli::CliCommand;
use clap::Parser;

#[test]
fn cli_parse_status() {
    match parse(&["fetchq", "status"]) {
        CliCommand::Status => {}
        _ => panic!("expected Status"),
    }
}

#[test]
fn cli_parse_pause() {
    match parse(&["fetchq", "pause", "42"]) {
        CliCommand::Pause { id } => assert_eq!(id, 42),
        _ => panic!("expected Pause"),
    }
}

#[test]
fn cli_parse_resume() {
    match parse(&["fetchq", "resume", "1"]) {
        CliCommand::Resume { id } => assert_eq!(id, 1),
        _ => panic!("expected Resume"),
    }
}

#[test]
fn cli_parse_cancel() {
    match parse(&["fetchq", "cancel", "7"]) {
        CliCommand::Cancel { id } => assert_eq!(id, 7),
        _ => panic!("expected Cancel"),
    }
}

#[test]
fn cli_parse_remove() {
    match parse(&["fetchq", "remove", "99"]) {
        CliCommand::Remove { id, delete_files } => {
            assert_eq!(id, 99);
            assert!(!delete_files);
        }
        _ => panic!("expected Remove"),
    }
}

#[test]
fn cli_parse_remove_delete_files() {
    match parse(&["fetchq", "remove", "3", "--delete-files"]) {
        CliCommand::Remove { id, delete_files } => {
            assert_eq!(id, 3);
            assert!(delete_files);
        }
        _ => panic!("expected Remove with --delete-files"),
    }
}

#[test]
fn cli_parse_report() {
    match parse(&["fetchq", "report", "--strict"]) {
        CliCommand::Report { strict } => assert!(strict),
        _ => panic!("expected Report"),
    }
}

#[test]
fn cli_parse_checksum() {
    match parse(&["fetchq", "checksum", "/tmp/file.iso"]) {
        CliCommand::Checksum { path } => {
            assert_eq!(path, std::path::PathBuf::from("/tmp/file.iso"))
        }
        _ => panic!("expected Checksum"),
    }
}

#[test]
fn cli_rejects_non_numeric_id() {
    assert!(crate::cli::Cli::try_parse_from(["fetchq", "pause", "abc"]).is_err());
}
