//! Infrastructure shape per vendor

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LoadBalancerIngress, Service};

use crate::types::ProviderType;

/// HTTPS port the front end is exposed on
pub const FRONT_END_PORT: u16 = 443;

/// Vendor-specific cluster infrastructure knowledge
pub trait InfrastructureProvider: Send + Sync {
    /// Vendor this provider targets
    fn provider_type(&self) -> ProviderType;

    /// CSI provisioner for data store volumes
    fn storage_provisioner(&self) -> &'static str;

    /// Parameters for the data store's storage class
    fn storage_class_parameters(&self) -> BTreeMap<String, String>;

    /// Public URL of the front end reachable at `address`
    fn front_end_url(&self, address: &str) -> String {
        https_url(address, FRONT_END_PORT)
    }

    /// Address assigned to a load balancer service, if any yet
    fn load_balancer_address(&self, service: &Service) -> Option<String>;
}

/// `https://host:port`, bracketing IPv6 literals
pub fn https_url(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("https://[{address}]:{port}")
    } else {
        format!("https://{address}:{port}")
    }
}

/// Ingress points from a service's load balancer status
pub(crate) fn ingress(service: &Service) -> &[LoadBalancerIngress] {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default()
}

/// First non-empty hostname among the ingress points
pub(crate) fn first_hostname(service: &Service) -> Option<String> {
    ingress(service)
        .iter()
        .filter_map(|i| i.hostname.clone())
        .find(|h| !h.is_empty())
}

/// First non-empty IP among the ingress points
pub(crate) fn first_ip(service: &Service) -> Option<String> {
    ingress(service)
        .iter()
        .filter_map(|i| i.ip.clone())
        .find(|ip| !ip.is_empty())
}

pub(crate) fn parameters<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
