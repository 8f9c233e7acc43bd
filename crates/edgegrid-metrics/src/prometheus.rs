//! Prometheus text exposition of per-function aggregates.

use std::fmt::Write;

use crate::collector::FunctionSnapshot;

fn family<F>(out: &mut String, name: &str, help: &str, kind: &str, snapshots: &[FunctionSnapshot], value: F)
where
    F: Fn(&FunctionSnapshot) -> String,
{
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    for s in snapshots {
        let _ = writeln!(
            out,
            "{name}{{namespace=\"{}\",function=\"{}\"}} {}",
            s.function.namespace,
            s.function.name,
            value(s)
        );
    }
}

/// Render function snapshots plus the dropped-sample counter.
pub fn render_prometheus(snapshots: &[FunctionSnapshot], dropped_samples: u64) -> String {
    let mut out = String::new();

    family(
        &mut out,
        "edgegrid_function_response_time_ms",
        "Mean response time over the rolling window, in milliseconds.",
        "gauge",
        snapshots,
        |s| format!("{:.2}", s.response_time_ms),
    );
    family(
        &mut out,
        "edgegrid_function_requests",
        "Requests observed in the rolling window.",
        "gauge",
        snapshots,
        |s| s.request_count.to_string(),
    );
    family(
        &mut out,
        "edgegrid_function_throughput",
        "Requests per second over the rolling window.",
        "gauge",
        snapshots,
        |s| format!("{:.4}", s.throughput),
    );
    family(
        &mut out,
        "edgegrid_function_backends",
        "Backends currently tracked for the function.",
        "gauge",
        snapshots,
        |s| s.backends.to_string(),
    );

    out.push_str("# HELP edgegrid_samples_dropped_total Response samples dropped on a full channel.\n");
    out.push_str("# TYPE edgegrid_samples_dropped_total counter\n");
    let _ = writeln!(out, "edgegrid_samples_dropped_total {dropped_samples}");

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_core::FunctionKey;

    fn snapshot(ns: &str, name: &str) -> FunctionSnapshot {
        FunctionSnapshot {
            function: FunctionKey::new(ns, name),
            response_time_ms: 12.5,
            request_count: 42,
            throughput: 0.7,
            backends: 3,
        }
    }

    #[test]
    fn render_empty_keeps_declarations() {
        let out = render_prometheus(&[], 0);
        assert!(out.contains("# TYPE edgegrid_function_response_time_ms gauge"));
        assert!(out.contains("edgegrid_samples_dropped_total 0"));
    }

    #[test]
    fn render_single_function() {
        let out = render_prometheus(&[snapshot("openfaas-fn", "resize")], 7);
        let labels = "{namespace=\"openfaas-fn\",function=\"resize\"}";
        assert!(out.contains(&format!("edgegrid_function_response_time_ms{labels} 12.50")));
        assert!(out.contains(&format!("edgegrid_function_requests{labels} 42")));
        assert!(out.contains(&format!("edgegrid_function_throughput{labels} 0.7000")));
        assert!(out.contains(&format!("edgegrid_function_backends{labels} 3")));
        assert!(out.contains("edgegrid_samples_dropped_total 7"));
    }
}
