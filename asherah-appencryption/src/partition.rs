//! Key id naming for a partition within a service/product namespace.

/// A caller partition bound to its service and product.
///
/// System keys are shared by every partition of a product; intermediate keys
/// belong to exactly one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    id: String,
    service: String,
    product: String,
    suffix: Option<String>,
}

impl Partition {
    pub fn new(id: &str, service: &str, product: &str) -> Self {
        Self {
            id: id.to_string(),
            service: service.to_string(),
            product: product.to_string(),
            suffix: None,
        }
    }

    /// Namespaces key ids by region (`_{suffix}` appended).
    pub fn with_suffix(mut self, suffix: Option<String>) -> Self {
        self.suffix = suffix.filter(|s| !s.is_empty());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    pub fn system_key_id(&self) -> String {
        let base = format!("_SK_{}_{}", self.service, self.product);
        self.suffixed(base)
    }

    pub fn intermediate_key_id(&self) -> String {
        self.suffixed(self.unsuffixed_intermediate_key_id())
    }

    fn unsuffixed_intermediate_key_id(&self) -> String {
        format!("_IK_{}_{}_{}", self.id, self.service, self.product)
    }

    /// Whether `id` names this partition's intermediate key. Records written
    /// before a region suffix was enabled remain readable.
    pub fn is_valid_intermediate_key_id(&self, id: &str) -> bool {
        id == self.intermediate_key_id() || id == self.unsuffixed_intermediate_key_id()
    }

    fn suffixed(&self, base: String) -> String {
        match &self.suffix {
            Some(suffix) => format!("{base}_{suffix}"),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ids() {
        let p = Partition::new("user42", "svc", "prod");
        assert_eq!(p.system_key_id(), "_SK_svc_prod");
        assert_eq!(p.intermediate_key_id(), "_IK_user42_svc_prod");
    }

    #[test]
    fn suffixed_key_ids() {
        let p = Partition::new("user42", "svc", "prod").with_suffix(Some("us-west-2".into()));
        assert_eq!(p.system_key_id(), "_SK_svc_prod_us-west-2");
        assert_eq!(p.intermediate_key_id(), "_IK_user42_svc_prod_us-west-2");
        assert!(p.is_valid_intermediate_key_id("_IK_user42_svc_prod"));
        assert!(p.is_valid_intermediate_key_id("_IK_user42_svc_prod_us-west-2"));
        assert!(!p.is_valid_intermediate_key_id("_IK_user43_svc_prod"));
    }

    #[test]
    fn empty_suffix_is_ignored() {
        let p = Partition::new("a", "s", "p").with_suffix(Some(String::new()));
        assert_eq!(p.suffix(), None);
        assert_eq!(p.intermediate_key_id(), "_IK_a_s_p");
    }
}
