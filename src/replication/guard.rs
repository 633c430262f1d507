use url::Url;

const LOOPBACK_ALIASES: [&str; 5] = ["localhost", "127.0.0.1", "::1", "[::1]", "0.0.0.0"];

fn is_loopback(host: &str) -> bool {
    LOOPBACK_ALIASES.contains(&host.to_ascii_lowercase().as_str())
}

/// True when `remote` points back at this instance (`local_host:local_port`).
/// Loopback aliases are treated as the same host.
pub fn is_self_reference(remote: &Url, local_host: &str, local_port: u16) -> bool {
    let Some(remote_port) = remote.port_or_known_default() else {
        return false;
    };
    if remote_port != local_port {
        return false;
    }

    let Some(remote_host) = remote.host_str() else {
        return false;
    };
    if remote_host.eq_ignore_ascii_case(local_host) {
        return true;
    }
    is_loopback(remote_host) && is_loopback(local_host)
}
