use serde::Deserialize;

const fn default_max_page_size() -> usize {
    1000
}

const fn default_page_size() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Largest `limit` a list request may ask for.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// `limit` used when a list request does not give one.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
            default_page_size: default_page_size(),
        }
    }
}

impl ControlConfig {
    /// Clamp a requested page size into `1..=max_page_size`.
    #[must_use]
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn page_size_is_clamped() {
        let config = ControlConfig::default();
        assert_eq!(config.page_size(None), 50);
        assert_eq!(config.page_size(Some(0)), 1);
        assert_eq!(config.page_size(Some(5_000)), 1000);
        assert_eq!(config.page_size(Some(7)), 7);
    }

    #[test]
    fn ron_overrides() {
        let config: ControlConfig = ron::from_str("(max_page_size: 10)").unwrap();
        assert_eq!(config.max_page_size, 10);
        assert_eq!(config.default_page_size, 50);
        assert_eq!(config.page_size(None), 10);
    }
}
