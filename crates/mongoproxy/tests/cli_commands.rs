#![cfg(feature = "cli")]

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use bson::doc;
use mongoproxy_transport::{ProxyStream, TcpTransport};
use mongoproxy_wire::{decode_request, encode_response, CommandReply, FrameReader, Response};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "mongoproxy-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn mongoproxy(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mongoproxy"))
        .args(["--log-level", "error"])
        .args(args)
        .env_remove("MONGO_ADDRESSES")
        .env_remove("MONGO_PASSWORD")
        .output()
        .expect("mongoproxy should run")
}

fn free_port() -> u16 {
    let transport = TcpTransport::bind("127.0.0.1:0").expect("bind should succeed");
    transport.local_addr().port()
}

/// Answers every command, legacy or `OP_MSG`, with a standalone handshake reply.
fn start_backend() -> String {
    let transport = TcpTransport::bind("127.0.0.1:0").expect("backend should bind");
    let address = transport.local_addr().to_string();
    thread::spawn(move || {
        while let Ok(stream) = transport.accept() {
            thread::spawn(move || serve_backend(stream));
        }
    });
    address
}

fn serve_backend(stream: ProxyStream) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = FrameReader::new(stream);
    while let Ok(Some(frame)) = reader.read_frame() {
        let Ok(request) = decode_request(&frame) else {
            return;
        };
        if !request.expects_reply() {
            continue;
        }
        let mut response = Response::new();
        response.write(CommandReply {
            reply: doc! {
                "ismaster": true,
                "maxWireVersion": 13,
                "minWireVersion": 0,
                "logicalSessionTimeoutMinutes": 30,
                "ok": 1.0,
            },
        });
        let Ok(bytes) = encode_response(&frame.header, request.kind(), &response) else {
            return;
        };
        if writer.write_all(&bytes).is_err() {
            return;
        }
    }
}

struct Proxy(Child);

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn version_prints_package_version() {
    let output = mongoproxy(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn config_redacts_credentials() {
    let dir = unique_temp_dir("config");
    let path = dir.join("proxy.json");
    std::fs::write(
        &path,
        r#"{
            "port": 27999,
            "stages": [
                { "name": "trace" },
                {
                    "name": "mongod",
                    "config": {
                        "addresses": ["db1:27017"],
                        "auth": { "username": "app", "password": "hunter2" }
                    }
                }
            ]
        }"#,
    )
    .expect("config should be writable");

    let output = mongoproxy(&[
        "--format",
        "json",
        "config",
        "--config",
        path.to_str().expect("utf-8 path"),
        "--read-only",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("hunter2"));
    assert!(stdout.contains("***"));
    assert!(stdout.contains("27999"));
    assert!(stdout.contains(r#""readOnly":true"#));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn config_rejects_malformed_file() {
    let dir = unique_temp_dir("bad-config");
    let path = dir.join("proxy.json");
    std::fs::write(&path, "{ not json").expect("config should be writable");

    let output = mongoproxy(&["config", "--config", path.to_str().expect("utf-8 path")]);
    assert_eq!(output.status.code(), Some(78));

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn ping_fails_against_closed_port() {
    let address = format!("127.0.0.1:{}", free_port());
    let output = mongoproxy(&["ping", &address, "--timeout", "1s"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("error:"));
}

#[test]
fn serve_proxies_ping_to_backend() {
    let backend = start_backend();
    let port = free_port();

    let dir = unique_temp_dir("serve");
    let path = dir.join("proxy.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
                "port": {port},
                "listen": "127.0.0.1",
                "stages": [ {{ "name": "mongod", "config": {{ "addresses": ["{backend}"] }} }} ]
            }}"#
        ),
    )
    .expect("config should be writable");

    let child = Command::new(env!("CARGO_BIN_EXE_mongoproxy"))
        .args(["--log-level", "error", "serve", "--config"])
        .arg(&path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");
    let _proxy = Proxy(child);

    let address = format!("127.0.0.1:{port}");
    let start = Instant::now();
    let output = loop {
        let output = mongoproxy(&["--format", "json", "ping", &address, "--timeout", "2s"]);
        if output.status.success() || start.elapsed() > Duration::from_secs(20) {
            break output;
        }
        thread::sleep(Duration::from_millis(50));
    };

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(r#""ok":true"#));
    assert!(stdout.contains("maxWireVersion"));

    let _ = std::fs::remove_dir_all(dir);
}
