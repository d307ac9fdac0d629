use std::fmt::Write;

use quiltdb_core::PeerId;

/// Replication counters, rendered in Prometheus text exposition form.
#[derive(Debug, Default)]
pub struct Metrics {
    pub messages_in: u64,
    pub messages_out: u64,
    pub retransmission_in: u64,
    pub retransmission_out: u64,
    pub maintenance_seconds: f64,
    pub read_your_write_timeouts: u64,
    pub max_drift_ms: u64,
}

impl Metrics {
    pub fn note_drift(&mut self, drift_ms: u64) {
        if drift_ms > self.max_drift_ms {
            self.max_drift_ms = drift_ms;
        }
    }

    pub(crate) fn render(&self, connected_peers: usize, lags: &[(PeerId, f64)]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# TYPE db_replication_connected_peers gauge");
        let _ = writeln!(out, "db_replication_connected_peers {connected_peers}");
        let _ = writeln!(out, "# TYPE db_replication_lag_seconds gauge");
        for (peer, lag) in lags {
            let _ = writeln!(
                out,
                "db_replication_lag_seconds{{remote_peer=\"{peer}\"}} {lag:.3}"
            );
        }
        let _ = writeln!(out, "# TYPE db_replication_messages_total counter");
        let _ = writeln!(
            out,
            "db_replication_messages_total{{direction=\"in\"}} {}",
            self.messages_in
        );
        let _ = writeln!(
            out,
            "db_replication_messages_total{{direction=\"out\"}} {}",
            self.messages_out
        );
        let _ = writeln!(
            out,
            "# TYPE db_replication_retransmission_requests_total counter"
        );
        let _ = writeln!(
            out,
            "db_replication_retransmission_requests_total{{direction=\"in\"}} {}",
            self.retransmission_in
        );
        let _ = writeln!(
            out,
            "db_replication_retransmission_requests_total{{direction=\"out\"}} {}",
            self.retransmission_out
        );
        let _ = writeln!(out, "# TYPE db_maintenance_time_seconds_total counter");
        let _ = writeln!(
            out,
            "db_maintenance_time_seconds_total {:.6}",
            self.maintenance_seconds
        );
        let _ = writeln!(out, "# TYPE db_logical_clock_drift_max_seconds gauge");
        let _ = writeln!(
            out,
            "db_logical_clock_drift_max_seconds {:.3}",
            self.max_drift_ms as f64 / 1000.0
        );
        let _ = writeln!(out, "# TYPE db_read_your_write_timeouts_total counter");
        let _ = writeln!(
            out,
            "db_read_your_write_timeouts_total {}",
            self.read_your_write_timeouts
        );
        out
    }
}
