//! Resource quantity arithmetic.
//!
//! Quantities are summed as integer milli-units so CPU (`250m`) and memory
//! (`16Gi`) share one representation. Fractions are rounded up.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Parses a quantity string into milli-units.
pub fn parse_milli(q: &str) -> Option<i128> {
    let q = q.trim();
    if q.is_empty() {
        return None;
    }

    let split = q
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let digits = format!("{int_part}{frac_part}");
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mantissa: i128 = digits.parse().ok()?;
    let mut den: i128 = 10i128.checked_pow(u32::try_from(frac_part.len()).ok()?)?;

    let mut num: i128 = 1000;
    match suffix {
        "" => {}
        "Ki" => num *= 1 << 10,
        "Mi" => num *= 1 << 20,
        "Gi" => num *= 1 << 30,
        "Ti" => num *= 1 << 40,
        "Pi" => num *= 1 << 50,
        "Ei" => num *= 1 << 60,
        "n" => den *= 1_000_000_000,
        "u" => den *= 1_000_000,
        "m" => den *= 1000,
        "k" => num *= 1000,
        "M" => num *= 1_000_000,
        "G" => num *= 1_000_000_000,
        "T" => num *= 1_000_000_000_000,
        "P" => num *= 1_000_000_000_000_000,
        "E" => num *= 1_000_000_000_000_000_000,
        s if s.starts_with(['e', 'E']) => {
            let exp: i32 = s[1..].parse().ok()?;
            let pow = 10i128.checked_pow(exp.unsigned_abs())?;
            if exp >= 0 {
                num = num.checked_mul(pow)?;
            } else {
                den = den.checked_mul(pow)?;
            }
        }
        _ => return None,
    }

    let scaled = mantissa.checked_mul(num)?;
    let value = (scaled + den - 1) / den;
    Some(if negative { -value } else { value })
}

/// Renders milli-units as a quantity, whole units without suffix.
pub fn format_milli(milli: i128) -> Quantity {
    if milli % 1000 == 0 {
        Quantity((milli / 1000).to_string())
    } else {
        Quantity(format!("{milli}m"))
    }
}

/// Named resource totals in milli-units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTotals(BTreeMap<String, i128>);

impl ResourceTotals {
    /// Adds `milli` to resource `name`.
    pub fn add(&mut self, name: &str, milli: i128) {
        *self.0.entry(name.to_string()).or_insert(0) += milli;
    }

    /// Adds every parseable quantity of a resource list.
    pub fn add_list(&mut self, list: &BTreeMap<String, Quantity>) {
        for (name, q) in list {
            if let Some(milli) = parse_milli(&q.0) {
                self.add(name, milli);
            }
        }
    }

    /// Adds another total.
    pub fn add_totals(&mut self, other: &ResourceTotals) {
        for (name, milli) in &other.0 {
            self.add(name, *milli);
        }
    }

    /// Raises each resource to at least the value in `list`.
    pub fn set_max(&mut self, list: &BTreeMap<String, Quantity>) {
        for (name, q) in list {
            if let Some(milli) = parse_milli(&q.0) {
                let entry = self.0.entry(name.clone()).or_insert(0);
                if milli > *entry {
                    *entry = milli;
                }
            }
        }
    }

    /// Value of `name` in milli-units.
    pub fn get(&self, name: &str) -> i128 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Resource list with zero totals omitted.
    pub fn to_list(&self) -> BTreeMap<String, Quantity> {
        self.0
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(k, v)| (k.clone(), format_milli(*v)))
            .collect()
    }
}

/// Effective request of a pod: app containers summed, then raised to each init container.
pub fn pod_requests(pod: &Pod) -> ResourceTotals {
    let mut totals = ResourceTotals::default();
    let Some(spec) = pod.spec.as_ref() else {
        return totals;
    };
    for container in &spec.containers {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            totals.add_list(requests);
        }
    }
    for container in spec.init_containers.iter().flatten() {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            totals.set_max(requests);
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};

    fn requests(pairs: &[(&str, &str)]) -> Option<ResourceRequirements> {
        Some(ResourceRequirements {
            requests: Some(pairs.iter().map(|(k, v)| (k.to_string(), Quantity(v.to_string()))).collect()),
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_milli_suffixes() {
        assert_eq!(parse_milli("250m"), Some(250));
        assert_eq!(parse_milli("2"), Some(2000));
        assert_eq!(parse_milli("1.5"), Some(1500));
        assert_eq!(parse_milli("1Ki"), Some(1024 * 1000));
        assert_eq!(parse_milli("1k"), Some(1_000_000));
        assert_eq!(parse_milli("1e3"), Some(1_000_000));
        assert_eq!(parse_milli("1n"), Some(1));
        assert_eq!(parse_milli("lots"), None);
        assert_eq!(parse_milli(""), None);
    }

    #[test]
    fn test_format_milli() {
        assert_eq!(format_milli(2000).0, "2");
        assert_eq!(format_milli(1500).0, "1500m");
    }

    #[test]
    fn test_pod_requests_takes_max_of_init_containers() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![
                    Container { name: "a".into(), resources: requests(&[("cpu", "500m"), ("memory", "1Gi")]), ..Default::default() },
                    Container { name: "b".into(), resources: requests(&[("cpu", "500m")]), ..Default::default() },
                ],
                init_containers: Some(vec![Container {
                    name: "init".into(),
                    resources: requests(&[("cpu", "2"), ("memory", "100Mi")]),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let totals = pod_requests(&pod);
        assert_eq!(totals.get("cpu"), 2000);
        assert_eq!(totals.get("memory"), (1i128 << 30) * 1000);
    }

    #[test]
    fn test_to_list_omits_zero() {
        let mut totals = ResourceTotals::default();
        totals.add("cpu", 0);
        totals.add("pods", 3000);
        let list = totals.to_list();
        assert!(!list.contains_key("cpu"));
        assert_eq!(list.get("pods").map(|q| q.0.as_str()), Some("3"));
    }
}
