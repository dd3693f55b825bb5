use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use linewire::config::DEFAULT_PORT;

#[derive(Parser)]
#[command(about = "Test client for the linewire line protocol receiver")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send a few records, then a malformed line, and check the server's reactions (default)
    Smoke,
    /// Write records over concurrent connections and report throughput
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Records per connection
        #[arg(short, long, default_value_t = 100_000)]
        records: usize,
        /// Distinct tables to spread records over
        #[arg(short, long, default_value_t = 8)]
        tables: usize,
    },
}

fn record(table: usize, connection: usize, seq: usize) -> String {
    format!(
        "bench_{table},conn={connection} seq={seq}i,value={:.3},ok=t {}\n",
        seq as f64 * 0.5,
        1_700_000_000_000_000_000u64 + seq as u64
    )
}

/// Half-close the write side and wait for the server to close the connection.
fn finish(mut stream: TcpStream, timeout: Duration) -> io::Result<()> {
    stream.shutdown(Shutdown::Write)?;
    stream.set_read_timeout(Some(timeout))?;
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    match args.command.unwrap_or(Command::Smoke) {
        Command::Smoke => smoke_test(&addr),
        Command::Bench {
            connections,
            records,
            tables,
        } => bench_test(&addr, connections, records, tables.max(1)),
    }
}

fn smoke_test(addr: &str) -> io::Result<()> {
    eprintln!("smoke test: connecting to {addr}");

    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(b"smoke,host=a value=1i\n")?;
    stream.write_all(b"smoke,host=b value=2.5,label=\"two words\" 1700000000000000000\n")?;
    stream.write_all(b"# comment lines are skipped\n\n")?;
    finish(stream, Duration::from_secs(5))?;
    eprintln!("  well-formed records: OK (server closed after EOF)");

    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(b"not a valid line\n")?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Ok(n) => return Err(io::Error::other(format!("unexpected {n} byte reply"))),
        Err(e) => return Err(e),
    }
    eprintln!("  malformed line: OK (connection dropped)");

    eprintln!("smoke test: PASSED");
    Ok(())
}

fn bench_test(
    addr: &str,
    num_connections: usize,
    records_per_conn: usize,
    tables: usize,
) -> io::Result<()> {
    eprintln!(
        "bench: {num_connections} connections x {records_per_conn} records over {tables} tables to {addr}"
    );

    let start = Instant::now();
    let handles: Vec<_> = (0..num_connections)
        .map(|connection| {
            let addr = addr.to_string();
            std::thread::spawn(move || -> io::Result<usize> {
                let mut stream = TcpStream::connect(&addr)?;
                stream.set_nodelay(true)?;
                let mut batch = String::with_capacity(64 * 1024);
                let mut bytes = 0;
                for seq in 0..records_per_conn {
                    batch.push_str(&record(seq % tables, connection, seq));
                    if batch.len() >= 60 * 1024 {
                        stream.write_all(batch.as_bytes())?;
                        bytes += batch.len();
                        batch.clear();
                    }
                }
                stream.write_all(batch.as_bytes())?;
                bytes += batch.len();
                finish(stream, Duration::from_secs(60))?;
                Ok(bytes)
            })
        })
        .collect();

    let mut total_bytes = 0;
    for handle in handles {
        let sent = handle
            .join()
            .map_err(|_| io::Error::other("connection thread panicked"))??;
        total_bytes += sent;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let total = num_connections * records_per_conn;
    eprintln!(
        "bench: {} records ({:.1} MB) in {:.2}s = {:.0} records/s",
        total,
        total_bytes as f64 / 1_000_000.0,
        elapsed,
        total as f64 / elapsed
    );
    Ok(())
}
