use std::collections::BTreeMap;

/// `(container_port, protocol, host_port)` — the canonical form both the
/// desired spec and the engine report are reduced to before comparison.
pub(crate) type CanonicalPort = (u16, String, u16);

const DEFAULT_PROTO: &str = "tcp";

/// Canonicalise a desired port map (`hostPort -> containerPort`).
/// Returns `None` when any entry fails to parse as a 16-bit port.
pub(crate) fn canonical_desired(ports: &BTreeMap<String, String>) -> Option<Vec<CanonicalPort>> {
    let mut out = Vec::with_capacity(ports.len());
    for (host, container) in ports {
        let host: u16 = host.parse().ok()?;
        let container: u16 = container.parse().ok()?;
        out.push((container, DEFAULT_PROTO.to_owned(), host));
    }
    out.sort();
    Some(out)
}

/// Canonicalise an engine port map
/// (`"<containerPort>/<proto>" -> "<hostIP>:<hostPort>"`, host IP and a
/// bare host port both accepted). Unparseable entries yield `None`.
pub(crate) fn canonical_engine(ports: &BTreeMap<String, String>) -> Option<Vec<CanonicalPort>> {
    let mut out = Vec::with_capacity(ports.len());
    for (key, binding) in ports {
        let (container, proto) = match key.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (key.as_str(), DEFAULT_PROTO),
        };
        let container: u16 = container.parse().ok()?;
        let host = binding.rsplit(':').next().unwrap_or(binding);
        let host: u16 = host.parse().ok()?;
        out.push((container, proto.to_owned(), host));
    }
    out.sort();
    Some(out)
}

/// Port equivalence: the canonical multisets agree. Anything unparseable
/// on either side counts as a mismatch so the container gets replaced.
pub(crate) fn matches(
    desired: &BTreeMap<String, String>,
    engine: &BTreeMap<String, String>,
) -> bool {
    match (canonical_desired(desired), canonical_engine(engine)) {
        (Some(desired), Some(engine)) => desired == engine,
        _ => false,
    }
}

/// The engine-side rendering of a desired port map, loopback-bound.
/// Feeding it back through [`canonical_engine`] returns the canonical
/// form of the input.
#[cfg(test)]
pub(crate) fn engine_view(desired: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    desired
        .iter()
        .map(|(host, container)| (format!("{container}/tcp"), format!("127.0.0.1:{host}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn desired_and_engine_forms_agree_after_canonicalisation() {
        let desired = map(&[("8080", "80"), ("9090", "3000")]);
        let engine = map(&[("80/tcp", "127.0.0.1:8080"), ("3000/tcp", "127.0.0.1:9090")]);
        assert!(matches(&desired, &engine));
    }

    #[test]
    fn host_ip_and_protocol_suffix_are_stripped() {
        let desired = map(&[("8080", "80")]);
        assert!(matches(&desired, &map(&[("80/tcp", "0.0.0.0:8080")])));
        assert!(matches(&desired, &map(&[("80", "8080")])));
    }

    #[test]
    fn differing_host_port_is_a_mismatch() {
        let desired = map(&[("9090", "80")]);
        let engine = map(&[("80/tcp", "127.0.0.1:8080")]);
        assert!(!matches(&desired, &engine));
    }

    #[test]
    fn differing_protocol_is_a_mismatch() {
        let desired = map(&[("8080", "80")]);
        let engine = map(&[("80/udp", "127.0.0.1:8080")]);
        assert!(!matches(&desired, &engine));
    }

    #[test]
    fn extra_engine_binding_is_a_mismatch() {
        let desired = map(&[("8080", "80")]);
        let engine = map(&[("80/tcp", "127.0.0.1:8080"), ("443/tcp", "127.0.0.1:8443")]);
        assert!(!matches(&desired, &engine));
    }

    #[test]
    fn unparseable_entries_never_match() {
        let desired = map(&[("http", "80")]);
        let engine = map(&[("80/tcp", "127.0.0.1:8080")]);
        assert!(!matches(&desired, &engine));
    }

    #[test]
    fn empty_maps_match() {
        assert!(matches(&BTreeMap::new(), &BTreeMap::new()));
    }

    #[test]
    fn engine_view_round_trips_to_the_canonical_form() {
        let desired = map(&[("8080", "80"), ("9090", "3000")]);
        let round = canonical_engine(&engine_view(&desired)).unwrap();
        assert_eq!(round, canonical_desired(&desired).unwrap());
    }
}
