//! `Accept` and `Accept-Encoding` negotiation.
//!
//! Quality values follow RFC 7231. Among offers of equal quality the more
//! specific match wins (`type/subtype` over `type/*` over `*/*`), then the
//! offer listed first.

/// One entry of an `Accept*` header.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptSpec {
    pub value: String,
    pub q: f64,
}

/// Parse a comma separated `Accept*` header value.
pub fn parse_accept(header: &str) -> Vec<AcceptSpec> {
    header
        .split(',')
        .filter_map(|part| {
            let mut params = part.split(';');
            let value = params.next()?.trim().to_ascii_lowercase();
            if value.is_empty() {
                return None;
            }
            let mut q = 1.0;
            for param in params {
                if let Some((key, val)) = param.split_once('=') {
                    if key.trim().eq_ignore_ascii_case("q") {
                        q = val.trim().parse().unwrap_or(0.0);
                    }
                }
            }
            Some(AcceptSpec { value, q })
        })
        .collect()
}

/// Pick the best of `offers` for an `Accept` header.
///
/// Each offer takes the quality of the most specific range matching it, so
/// `application/protobuf;q=0, */*` refuses protobuf but accepts the rest.
/// Returns `default` when the header is absent or accepts none of them.
pub fn negotiate_content_type<'a>(header: Option<&str>, offers: &[&'a str], default: &'a str) -> &'a str {
    let Some(header) = header.filter(|h| !h.trim().is_empty()) else {
        return default;
    };
    let specs = parse_accept(header);

    let mut best = default;
    let mut best_q = 0.0;
    let mut best_specificity = 0;
    for &offer in offers {
        let Some((q, specificity)) = offer_quality(&specs, &offer.to_ascii_lowercase()) else {
            continue;
        };
        if q <= 0.0 {
            continue;
        }
        if q > best_q || (q == best_q && specificity > best_specificity) {
            best = offer;
            best_q = q;
            best_specificity = specificity;
        }
    }
    best
}

/// Quality and specificity of the most specific range matching `offer`.
fn offer_quality(specs: &[AcceptSpec], offer: &str) -> Option<(f64, u8)> {
    let mut found: Option<(f64, u8)> = None;
    for spec in specs {
        let specificity = if spec.value == "*/*" {
            1
        } else if let Some(prefix) = spec.value.strip_suffix("/*") {
            match offer.split_once('/') {
                Some((ty, _)) if ty == prefix => 2,
                _ => continue,
            }
        } else if spec.value == offer {
            3
        } else {
            continue;
        };
        if found.map_or(true, |(_, s)| specificity > s) {
            found = Some((spec.q, specificity));
        }
    }
    found
}

/// Pick the best of `offers` for an `Accept-Encoding` header.
///
/// `None` means identity.
pub fn negotiate_content_encoding<'a>(header: Option<&str>, offers: &[&'a str]) -> Option<&'a str> {
    let specs = parse_accept(header?);
    let mut best = None;
    let mut best_q = 0.0;
    for &offer in offers {
        for spec in &specs {
            if spec.q > best_q && (spec.value == "*" || spec.value.eq_ignore_ascii_case(offer)) {
                best = Some(offer);
                best_q = spec.q;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFERS: [&str; 2] = ["application/json", "application/protobuf"];

    #[test]
    fn test_parse_accept() {
        let specs = parse_accept("text/html, application/json;q=0.5 , */*; q=0");
        assert_eq!(
            specs,
            vec![
                AcceptSpec { value: "text/html".into(), q: 1.0 },
                AcceptSpec { value: "application/json".into(), q: 0.5 },
                AcceptSpec { value: "*/*".into(), q: 0.0 },
            ]
        );
    }

    #[test]
    fn test_content_type() {
        let cases = [
            (None, "application/json"),
            (Some("application/protobuf"), "application/protobuf"),
            (Some("*/*"), "application/json"),
            (Some("application/*"), "application/json"),
            (Some("application/json;q=0.5, application/protobuf"), "application/protobuf"),
            (Some("*/*;q=0.9, application/protobuf;q=0.9"), "application/protobuf"),
            (Some("text/html"), "application/json"),
            (Some("application/protobuf;q=0"), "application/json"),
            (Some("application/json;q=0, application/protobuf;q=0"), "application/json"),
            (Some("*/*;q=0"), "application/json"),
        ];
        for (header, want) in cases {
            assert_eq!(
                negotiate_content_type(header, &OFFERS, "application/json"),
                want,
                "{header:?}"
            );
        }
    }

    #[test]
    fn test_content_encoding() {
        let offers = ["gzip"];
        assert_eq!(negotiate_content_encoding(None, &offers), None);
        assert_eq!(negotiate_content_encoding(Some("gzip, deflate"), &offers), Some("gzip"));
        assert_eq!(negotiate_content_encoding(Some("*"), &offers), Some("gzip"));
        assert_eq!(negotiate_content_encoding(Some("gzip;q=0"), &offers), None);
        assert_eq!(negotiate_content_encoding(Some("br"), &offers), None);
    }

    #[test]
    fn test_refused_type_is_never_chosen() {
        let offers = ["application/protobuf", "application/json"];
        assert_eq!(
            negotiate_content_type(Some("application/protobuf;q=0"), &offers, "application/json"),
            "application/json"
        );
        assert_eq!(
            negotiate_content_type(Some("application/protobuf;q=0, */*;q=0.1"), &offers, "text/plain"),
            "application/json"
        );
        assert_eq!(
            negotiate_content_type(Some("*/*;q=0, application/json"), &offers, "text/plain"),
            "application/json"
        );
    }
}
