#![allow(dead_code)]

/// A mix of the line shapes ingestion sees: tags, several field types, optional timestamps.
pub fn mixed_lines(count: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..count {
        let line = match i % 4 {
            0 => format!("cpu,host=node{},region=eu usage_user={:.2},usage_idle=91.5\n", i % 16, i as f64 * 0.01),
            1 => format!("mem,host=node{} used={}i,free={}i,swap=f {}\n", i % 16, i * 1024, i * 512, 1_700_000_000_000_000_000u64 + i as u64),
            2 => format!("log,app=api,level=warn msg=\"request \\\"{}\\\" slow\",code={}i\n", i, 200 + i % 300),
            _ => format!("net\\ io,iface=eth0 rx={}i,tx={}i,up=true\n", i * 3, i * 7),
        };
        buf.extend_from_slice(line.as_bytes());
    }
    buf
}
