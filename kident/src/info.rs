use crate::{conntrack::TrackingBackend, diag::DiagClient, endpoint::NatRecord};
use chrono::{DateTime, Local};
use std::fmt;

/// Column aligned text table
pub struct InfoTable {
    rows: Vec<Vec<String>>,
    sizes: Vec<usize>,
}

impl InfoTable {
    pub fn new(header: Vec<&str>) -> Self {
        let rows = vec![header.iter().map(|s| s.to_string()).collect::<Vec<_>>()];
        let sizes = rows[0].iter().map(|s| s.len()).collect();
        Self { rows, sizes }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        for (i, s) in row.iter().enumerate().take(self.sizes.len()) {
            self.sizes[i] = self.sizes[i].max(s.len());
        }
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prints the table under a banner
    pub fn print(&self, header: &str) {
        println!("\r\n{0:-<1$}\r\n{header}\r\n{0:-<1$}", "-", header.len());
        print!("{}", self);
    }
}

impl fmt::Display for InfoTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let last = self.sizes.len() - 1;
        let mut hdr_len = 0_usize;
        for (i, row) in self.rows.iter().enumerate() {
            let line = self
                .sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| {
                    let cell = row.get(i).map(|s| s.as_str()).unwrap_or_default();
                    format!("{0:<1$}", cell, size + 1)
                })
                .collect::<String>();
            writeln!(f, "{}", line.trim_end())?;
            if i == 0 {
                hdr_len = line.len() - self.sizes[last] + self.rows[0][last].len() - 1;
                writeln!(f, "{0:-<1$}", '-', hdr_len)?;
            } else if i == self.rows.len() - 1 {
                writeln!(f, "{0:-<1$}", '-', hdr_len)?;
            }
        }
        Ok(())
    }
}

/// NAT records as listed by `conntrack`
pub fn nat_table<I: IntoIterator<Item = NatRecord>>(records: I) -> InfoTable {
    let mut tab = InfoTable::new(vec![
        "proto",
        "internal",
        "destination",
        "peer",
        "external",
        "kind",
    ]);
    for rec in records {
        let kind = if rec.is_local_loop() { "loop" } else { "masq" };
        tab.push_row(vec![
            rec.proto.name().to_string(),
            rec.orig_src.to_string(),
            rec.orig_dst.to_string(),
            rec.reply_src.to_string(),
            rec.reply_dst.to_string(),
            kind.to_string(),
        ]);
    }
    tab
}

/// State reported by `probe`
pub fn probe_table(backend: &TrackingBackend, diag: &DiagClient, masq: bool) -> InfoTable {
    let now: DateTime<Local> = Local::now();
    let mut tab = InfoTable::new(vec!["item", "value"]);
    let backend = match backend.kind() {
        Some(kind) => kind.to_string(),
        None if masq => "unavailable".to_string(),
        None => "disabled".to_string(),
    };
    let diag = if diag.is_open() { "open" } else { "closed" };
    tab.push_row(vec!["nat backend".to_string(), backend]);
    tab.push_row(vec!["socket diag".to_string(), diag.to_string()]);
    tab.push_row(vec![
        "probed at".to_string(),
        now.format("%H:%M:%S %d-%m-%Y").to_string(),
    ]);
    tab
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conntrack::parse_line, conntrack::tests::IP_CT, conntrack::BackendKind};

    #[test]
    fn aligned_columns() {
        let mut tab = InfoTable::new(vec!["name", "id"]);
        tab.push_row(vec!["ip_conntrack".to_string(), "1".to_string()]);
        tab.push_row(vec!["x".to_string(), "22".to_string()]);
        assert_eq!(tab.len(), 2);
        assert_eq!(
            tab.to_string(),
            "name         id\n---------------\nip_conntrack 1\nx            22\n---------------\n"
        );
    }

    #[test]
    fn nat_rows() {
        let rec = parse_line(BackendKind::IpConntrack, IP_CT).unwrap();
        let tab = nat_table(vec![rec]);
        assert!(!tab.is_empty());
        let text = tab.to_string();
        assert!(text.contains("192.168.1.10:4000"));
        assert!(text.contains("loop"));
        assert!(nat_table(vec![]).is_empty());
    }

    #[test]
    fn probe_rows() {
        let text = probe_table(&TrackingBackend::Netlink, &DiagClient::disabled(), true).to_string();
        assert!(text.contains("ctnetlink"));
        assert!(text.contains("closed"));
        let text = probe_table(&TrackingBackend::Disabled, &DiagClient::disabled(), true).to_string();
        assert!(text.contains("unavailable"));
    }
}
