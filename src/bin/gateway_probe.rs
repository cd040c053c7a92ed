use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

fn main() {
    let mut args = env::args().skip(1);
    let gateway = args.next().unwrap_or_else(|| "127.0.0.1:8118".to_string());
    let target = args.next().unwrap_or_else(|| "example.com:443".to_string());

    match probe_connect(&gateway, &target) {
        Ok(()) => {
            println!("CONNECT tunnel test passed");
            std::process::exit(0);
        }
        Err(e) => {
            println!("CONNECT tunnel test failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn probe_connect(gateway: &str, target: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Connecting to gateway at {}...", gateway);

    let mut sock = TcpStream::connect(gateway)?;
    sock.set_read_timeout(Some(Duration::from_secs(10)))?;
    println!("Connected successfully");

    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    sock.write_all(request.as_bytes())?;
    println!("Request sent: CONNECT {}", target);

    let mut response = vec![0u8; ESTABLISHED.len()];
    let mut received = 0;
    while received < response.len() {
        match sock.read(&mut response[received..])? {
            0 => break,
            n => received += n,
        }
    }
    response.truncate(received);

    let status_line = String::from_utf8_lossy(&response);
    println!(
        "Response received: {}",
        status_line.lines().next().unwrap_or_default()
    );

    if response != ESTABLISHED {
        return Err(format!("Unexpected response: {:?}", status_line).into());
    }

    println!("Tunnel to {} established through the gateway", target);
    Ok(())
}
