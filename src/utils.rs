/// This machine's name reduced to a valid service name: the first DNS
/// label, with characters outside `[A-Za-z0-9-]` replaced by `-`.
pub(crate) fn local_host_identity() -> String {
    let raw = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into());
    sanitize_host_label(&raw)
}

pub(crate) fn sanitize_host_label(raw: &str) -> String {
    let label = raw.split('.').next().unwrap_or_default();
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => cleaned,
        Some(_) => format!("host-{cleaned}"),
        None => "localhost".into(),
    }
}

/// Host name in mDNS form, `<label>.local.`.
pub(crate) fn mdns_host(host: &str) -> String {
    let host = host.trim_end_matches('.');
    if host.ends_with(".local") {
        format!("{host}.")
    } else {
        format!("{host}.local.")
    }
}
