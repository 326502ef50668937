//! Inbound request payloads and their conversion into domain entities.
//!
//! Parsing is strict: unknown fields, malformed ids, bad base64, and
//! out-of-range values reject the whole request. `customer/add` builds every
//! customer tree before any of them is adopted, so a failure anywhere leaves
//! the server untouched.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use url::Url;

use crate::customer::{Customer, MINIMUM_POLLING_INTERVAL};
use crate::host_scheme::HostScheme;
use crate::monitor::{ContentCheckMode, HttpMethod, Monitor, PostContentType};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomerSpec {
    pub polling_interval: i64,
    #[serde(default)]
    pub ping: bool,
    #[serde(default)]
    pub ssl_expiration: bool,
    #[serde(default)]
    pub latency: bool,
    #[serde(default)]
    pub multi_region: bool,
    pub host_schemes: BTreeMap<String, HostSchemeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSchemeSpec {
    pub url: String,
    pub monitors: BTreeMap<String, MonitorSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSpec {
    pub uri: String,
    pub method: Option<String>,
    pub content_check_mode: Option<String>,
    pub post_content_type: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub post_user_agent: Option<String>,
    pub post_content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionChangeRequest {
    pub region_index: i64,
    pub number_regions: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomerRemoveRequest {
    pub customer_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomerPauseRequest {
    pub customer_id: u64,
    pub pause: bool,
}

/// True for ids that fit the wire range 1..2^32-1.
pub fn valid_entity_id(id: u64) -> bool {
    (1..=u64::from(u32::MAX)).contains(&id)
}

/// Builds every customer in the batch, or reports the first failure as the
/// response status string.
pub fn build_customers(specs: BTreeMap<String, CustomerSpec>) -> Result<Vec<Customer>, String> {
    let mut customers = Vec::with_capacity(specs.len());
    for (customer_id, spec) in specs {
        customers.push(build_customer(&customer_id, spec)?);
    }
    Ok(customers)
}

fn build_customer(customer_id: &str, spec: CustomerSpec) -> Result<Customer, String> {
    let id: u32 = customer_id
        .parse()
        .ok()
        .filter(|&id| id != 0)
        .ok_or_else(|| format!("failed, invalid customer ID {customer_id}"))?;

    if spec.polling_interval < i64::from(MINIMUM_POLLING_INTERVAL) {
        return Err(format!("failed, invalid polling interval, customer {id}"));
    }

    let mut customer = Customer::new(
        id,
        spec.ping,
        spec.ssl_expiration,
        spec.latency,
        spec.multi_region,
        spec.polling_interval as u32,
    );

    for (host_scheme_id, host_scheme_spec) in spec.host_schemes {
        customer.add_host_scheme(build_host_scheme(&host_scheme_id, host_scheme_spec)?);
    }

    Ok(customer)
}

fn build_host_scheme(host_scheme_id: &str, spec: HostSchemeSpec) -> Result<HostScheme, String> {
    let id: u32 = host_scheme_id
        .parse()
        .ok()
        .filter(|&id| id != 0)
        .ok_or_else(|| format!("failed, invalid host/scheme ID {host_scheme_id}"))?;

    let mut url = Url::parse(&spec.url)
        .ok()
        .filter(|url| url.has_host())
        .ok_or_else(|| format!("failed, invalid URL, host/scheme {id}"))?;
    // Scheme and authority only; monitors supply the paths.
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);

    let mut host_scheme = HostScheme::new(id, url);
    for (monitor_id, monitor_spec) in spec.monitors {
        host_scheme.add_monitor(build_monitor(&monitor_id, monitor_spec)?);
    }

    Ok(host_scheme)
}

fn build_monitor(monitor_id: &str, spec: MonitorSpec) -> Result<Monitor, String> {
    let id: u32 = monitor_id
        .parse()
        .ok()
        .filter(|&id| id != 0)
        .ok_or_else(|| format!("failed, invalid monitors ID {monitor_id}"))?;

    let method = match spec.method {
        Some(method) => HttpMethod::parse(&method).ok_or_else(|| {
            format!("failed, invalid method, use \"get\" or \"post\", monitor ID {id}")
        })?,
        None => HttpMethod::Get,
    };

    let check_mode = match spec.content_check_mode {
        Some(mode) => ContentCheckMode::parse(&mode).ok_or_else(|| {
            format!(
                "failed, invalid content_check_mode, use \"no_check\", \"content_match\", \
                 \"all_keywords\", \"any_keywords\", or \"smart_content_match\", monitor ID {id}"
            )
        })?,
        None => ContentCheckMode::NoCheck,
    };

    let content_type = match spec.post_content_type {
        Some(content_type) => PostContentType::parse(&content_type).ok_or_else(|| {
            format!("failed, invalid post_content_type, use \"text\", \"json\", or \"xml\", monitor ID {id}")
        })?,
        None => PostContentType::Text,
    };

    let mut keywords = Vec::new();
    if let Some(encoded_keywords) = spec.keywords {
        keywords.reserve(encoded_keywords.len());
        for encoded in encoded_keywords {
            let keyword = BASE64.decode(&encoded).map_err(|_| {
                format!("failed, keyword entries should be base64 encoded as per RFC4648, monitor ID {id}")
            })?;
            keywords.push(keyword);
        }
    }

    let post_content = match spec.post_content {
        Some(encoded) => BASE64.decode(&encoded).map_err(|_| {
            format!("failed, post_content should be base64 encoded as per RFC4648, monitor ID {id}")
        })?,
        None => Vec::new(),
    };

    Ok(Monitor::new(
        id,
        spec.uri,
        method,
        check_mode,
        keywords,
        content_type,
        spec.post_user_agent.unwrap_or_default(),
        post_content,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn customer_specs(body: serde_json::Value) -> BTreeMap<String, CustomerSpec> {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn builds_a_full_customer_tree() {
        let specs = customer_specs(json!({
            "7": {
                "polling_interval": 30,
                "ping": true,
                "latency": true,
                "host_schemes": {
                    "11": {
                        "url": "https://a/",
                        "monitors": {
                            "101": {"uri": "/", "method": "get", "content_check_mode": "no_check"}
                        }
                    }
                }
            }
        }));

        let customers = build_customers(specs).unwrap();
        assert_eq!(customers.len(), 1);
        let customer = &customers[0];
        assert_eq!(customer.id, 7);
        assert!(customer.supports_ping_testing);
        assert!(!customer.supports_multi_region_testing);
        let host_scheme = customer.host_scheme(11).unwrap();
        assert_eq!(host_scheme.url.host_str(), Some("a"));
        assert!(host_scheme.monitor(101).is_some());
    }

    #[test]
    fn short_polling_intervals_reject() {
        let specs = customer_specs(json!({
            "7": {"polling_interval": 19, "host_schemes": {}}
        }));
        let error = build_customers(specs).unwrap_err();
        assert!(error.contains("invalid polling interval"));
    }

    #[test]
    fn zero_and_garbage_ids_reject() {
        for key in ["0", "x", "-3"] {
            let specs = customer_specs(json!({
                key: {"polling_interval": 30, "host_schemes": {}}
            }));
            assert!(build_customers(specs).unwrap_err().contains("invalid customer ID"));
        }
    }

    #[test]
    fn one_bad_customer_fails_the_batch() {
        let specs = customer_specs(json!({
            "7": {"polling_interval": 30, "host_schemes": {}},
            "8": {"polling_interval": 5, "host_schemes": {}}
        }));
        assert!(build_customers(specs).is_err());
    }

    #[test]
    fn unknown_monitor_fields_reject() {
        let result: Result<BTreeMap<String, CustomerSpec>, _> = serde_json::from_value(json!({
            "7": {
                "polling_interval": 30,
                "host_schemes": {
                    "11": {
                        "url": "https://a/",
                        "monitors": {"101": {"uri": "/", "surprise": true}}
                    }
                }
            }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_keyword_base64_rejects() {
        let specs = customer_specs(json!({
            "7": {
                "polling_interval": 30,
                "host_schemes": {
                    "11": {
                        "url": "https://a/",
                        "monitors": {"101": {"uri": "/", "keywords": ["not base64!!!"]}}
                    }
                }
            }
        }));
        assert!(build_customers(specs).unwrap_err().contains("RFC4648"));
    }

    #[test]
    fn host_scheme_urls_are_stripped_to_scheme_and_authority() {
        let specs = customer_specs(json!({
            "7": {
                "polling_interval": 30,
                "host_schemes": {
                    "11": {"url": "https://example.com:8443/some/path?x=1#frag", "monitors": {}}
                }
            }
        }));
        let customers = build_customers(specs).unwrap();
        let url = &customers[0].host_scheme(11).unwrap().url;
        assert_eq!(url.as_str(), "https://example.com:8443/");
    }
}
