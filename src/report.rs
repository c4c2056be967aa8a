//! Human readable renderings of a trace result.

use chrono::{DateTime, Local};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use crate::result::{HopRecord, TraceResult};

impl TraceResult {
    /// One line per recorded attempt, then the debug, loss, timestamp and outcome lines.
    pub fn marshal(&self) -> String {
        self.render(Local::now())
    }

    pub fn marshal_aggregate(&self) -> String {
        self.aggregate().marshal()
    }

    fn render(&self, now: DateTime<Local>) -> String {
        let mut lines: Vec<String> = self.hops.iter().map(|r| self.hop_line(r)).collect();
        lines.push(format!("debug id:{:<5} key:{:<35}", self.id, self.key.to_string()));
        lines.push(format!("pkg_loss:{:.2}%", self.avg_pkt_loss * 100.0));
        lines.push(now.format("%Y-%m-%d %H:%M:%S%.6f %z").to_string());
        lines.push(
            if self.done {
                "trace succeeded!"
            } else {
                "trace failed!"
            }
            .to_string(),
        );
        lines.join("\n")
    }

    fn hop_line(&self, r: &HopRecord) -> String {
        format!(
            "ttl:{:<4}| hop:{:<16}| src:{:<16}| dst:{:<16}|  latency:{:>13}| packet_loss:{:>7.2}%|  reached:{:<5}",
            r.ttl,
            hop_addr(r),
            self.target.src_ip().to_string(),
            self.target.dst_ip().to_string(),
            format!("{:?}", r.latency),
            r.packet_loss * 100.0,
            r.reached,
        )
    }
}

fn hop_addr(r: &HopRecord) -> String {
    r.hop.map(|h| h.to_string()).unwrap_or_default()
}

/// The aggregated result as a table, one row per TTL.
pub fn table(result: &TraceResult) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["TTL", "Hop", "Latency", "Loss", "Reached"]);

    for r in result.aggregate().hops {
        let hop = match r.hop {
            Some(addr) => addr.to_string(),
            None => "*".to_string(),
        };
        table.add_row(vec![
            Cell::new(r.ttl),
            Cell::new(hop),
            Cell::new(format!("{:.2?}", r.latency)),
            Cell::new(format!("{:.1}%", r.packet_loss * 100.0)),
            Cell::new(r.reached),
        ]);
    }
    table
}
