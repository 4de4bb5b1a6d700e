use std::net::TcpListener;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;

#[test]
fn server_prints_version() {
    Command::cargo_bin("tcpvars-server")
        .unwrap()
        .args(&["-V"])
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn client_rejects_bad_address() {
    Command::cargo_bin("tcpvars-client")
        .unwrap()
        .args(&["--addr", "not-an-address"])
        .assert()
        .failure()
        .stderr(contains("could not parse not-an-address"));
}

#[test]
fn client_without_server_fails_with_timeout() {
    // bind then drop, leaving a port nobody listens on
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    Command::cargo_bin("tcpvars-client")
        .unwrap()
        .args(&[
            "--addr",
            &format!("127.0.0.1:{}", port),
            "--timeout",
            "50",
            "--reconnect",
            "1",
        ])
        .assert()
        .failure()
        .stderr(contains("Please reconnect again."));
}
