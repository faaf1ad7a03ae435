//! StatsD clients for cache metrics.

use std::net::UdpSocket;

use anyhow::{Context, Result};
use cadence::{NopMetricSink, QueuingMetricSink, StatsdClient, UdpMetricSink};

const PREFIX: &str = "chunkcache";

/// Create the StatsD client for this application, emitting to the local agent
/// on the default port when `enabled`, or discarding all metrics otherwise.
pub fn client(enabled: bool) -> Result<StatsdClient> {
    if enabled {
        create_udp_client().context("config error: failed to initialize local StatsD client")
    } else {
        Ok(nop_client())
    }
}

/// A client that discards all metrics.
pub fn nop_client() -> StatsdClient {
    StatsdClient::from_sink(PREFIX, NopMetricSink)
}

fn create_udp_client() -> Result<StatsdClient> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let host = ("127.0.0.1", cadence::DEFAULT_PORT);
    let udp_sink = UdpMetricSink::from(host, socket)?;
    let queuing_sink = QueuingMetricSink::from(udp_sink);
    let client_builder = StatsdClient::builder(PREFIX, queuing_sink)
        .with_error_handler(|err| tracing::warn!("failed to send metric to StatsD: {err}"));

    Ok(client_builder.build())
}
