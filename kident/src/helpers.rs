use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub fn stou32(number: &str, base: u32) -> Option<u32> {
    u32::from_str_radix(number, base).ok()
}

pub fn stou16(number: &str, base: u32) -> Option<u16> {
    u16::from_str_radix(number, base).ok()
}

/// Parses the kernel's hex rendering of an IPv4 address in a socket table.
/// The kernel prints the raw in-memory word, so the bytes are native order.
pub fn ipv4_from_proc_hex(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let value = stou32(hex, 16)?;
    Some(Ipv4Addr::from(value.to_ne_bytes()))
}

/// Same as `ipv4_from_proc_hex` for the four words of an IPv6 address
pub fn ipv6_from_proc_hex(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 || !hex.is_ascii() {
        return None;
    }
    let mut octets = [0_u8; 16];
    for i in 0..4 {
        let word = stou32(&hex[i * 8..i * 8 + 8], 16)?;
        octets[i * 4..i * 4 + 4].copy_from_slice(&word.to_ne_bytes());
    }
    Some(Ipv6Addr::from(octets))
}

/// Parses `HEXADDR:HEXPORT` from /proc/net/tcp{,6}
pub fn proc_endpoint(value: &str, ipv6: bool) -> Option<(IpAddr, u16)> {
    let (addr, port) = value.split_once(':')?;
    let port = stou16(port, 16)?;
    let ip = if ipv6 {
        IpAddr::V6(ipv6_from_proc_hex(addr)?)
    } else {
        IpAddr::V4(ipv4_from_proc_hex(addr)?)
    };
    Some((ip, port))
}

/// The raw in-memory bytes of an address, as a kernel socket id holds them
pub fn ip_octets(ip: &IpAddr) -> [u8; 16] {
    let mut octets = [0_u8; 16];
    match ip {
        IpAddr::V4(ip) => octets[..4].copy_from_slice(&ip.octets()),
        IpAddr::V6(ip) => octets = ip.octets(),
    }
    octets
}

fn cstr_to_string(cstr_buff: *const libc::c_char) -> String {
    let str = unsafe { std::ffi::CStr::from_ptr(cstr_buff) };
    let str = str.to_string_lossy();
    str.to_string()
}

pub fn str_error(err: i32) -> String {
    let mut buff = [0 as libc::c_char; 256];
    let rc = unsafe { libc::strerror_r(err, buff.as_mut_ptr(), buff.len()) };

    if rc != 0 {
        format!("errno={}, unknown", err)
    } else {
        cstr_to_string(buff.as_ptr())
    }
}

pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn str_errno() -> String {
    str_error(errno())
}
