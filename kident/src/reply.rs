//! RFC 1413 reply lines

use std::{fmt, io};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentError {
    NoUser,
    HiddenUser,
}

impl fmt::Display for IdentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::NoUser => "NO-USER",
            Self::HiddenUser => "HIDDEN-USER",
        };
        write!(f, "{}", name)
    }
}

/// `lport,fport:USERID:os:user`
pub fn write_userid<W: io::Write + ?Sized>(
    out: &mut W,
    lport: u16,
    fport: u16,
    os: &str,
    user: &str,
) -> io::Result<()> {
    write!(out, "{},{}:USERID:{}:{}\r\n", lport, fport, os, user)
}

/// `lport,fport:ERROR:reason`
pub fn write_error<W: io::Write + ?Sized>(
    out: &mut W,
    lport: u16,
    fport: u16,
    err: IdentError,
) -> io::Result<()> {
    write!(out, "{},{}:ERROR:{}\r\n", lport, fport, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_lines() {
        let mut out = vec![];
        write_userid(&mut out, 6191, 23, "UNIX", "alice").unwrap();
        write_error(&mut out, 6191, 23, IdentError::HiddenUser).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "6191,23:USERID:UNIX:alice\r\n6191,23:ERROR:HIDDEN-USER\r\n"
        );
    }
}
