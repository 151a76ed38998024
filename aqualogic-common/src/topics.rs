use crate::error::{Error, Result};

/// Default discovery prefix used by Home Assistant.
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Default device identifier.
pub const DEFAULT_IDENTIFIER: &str = "aqualogic";

/// Builder for the bridge's MQTT topic surface.
///
/// All device topics live under the device root:
/// `<prefix>/device/<identifier>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
    identifier: String,
    root: String,
}

impl TopicBuilder {
    /// Create a topic builder.
    ///
    /// The prefix may contain several levels; the identifier must be a single
    /// level. Neither may be empty or contain MQTT wildcards.
    ///
    /// # Example
    /// ```
    /// use aqualogic_common::topics::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("homeassistant", "aqualogic").unwrap();
    /// assert_eq!(topics.state_topic(), "homeassistant/device/aqualogic/state");
    /// ```
    pub fn new(prefix: impl Into<String>, identifier: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let identifier = identifier.into();

        validate_level("discovery prefix", &prefix, true)?;
        validate_level("identifier", &identifier, false)?;

        let root = format!("{}/device/{}", prefix, identifier);
        Ok(Self {
            prefix,
            identifier,
            root,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Device root, `<prefix>/device/<identifier>`.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Topic carrying the discovery descriptor.
    pub fn discovery_topic(&self) -> String {
        format!("{}/config", self.root)
    }

    /// Topic carrying the flat state payload.
    pub fn state_topic(&self) -> String {
        format!("{}/state", self.root)
    }

    /// Topic carrying "online"/"offline" for the bridge.
    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.root)
    }

    /// Command topic for a single entity.
    ///
    /// # Example
    /// ```
    /// use aqualogic_common::topics::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("homeassistant", "aqualogic").unwrap();
    /// assert_eq!(
    ///     topics.command_topic("aqualogic_switch_filter"),
    ///     "homeassistant/device/aqualogic/aqualogic_switch_filter/set"
    /// );
    /// ```
    pub fn command_topic(&self, entity_id: &str) -> String {
        format!("{}/{}/set", self.root, entity_id)
    }

    /// Wildcard matching every entity command topic.
    pub fn command_wildcard(&self) -> String {
        format!("{}/+/set", self.root)
    }

    /// Home Assistant birth/will topic, `<prefix>/status`.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.prefix)
    }
}

fn validate_level(what: &str, value: &str, allow_separators: bool) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Topic(format!("{} must not be empty", what)));
    }
    if value.contains(['+', '#', '\0']) {
        return Err(Error::Topic(format!(
            "{} '{}' must not contain wildcards",
            what, value
        )));
    }
    if value.starts_with('/') || value.ends_with('/') || value.contains("//") {
        return Err(Error::Topic(format!(
            "{} '{}' has an empty topic level",
            what, value
        )));
    }
    if !allow_separators && value.contains('/') {
        return Err(Error::Topic(format!(
            "{} '{}' must be a single topic level",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> TopicBuilder {
        TopicBuilder::new(DEFAULT_DISCOVERY_PREFIX, DEFAULT_IDENTIFIER).unwrap()
    }

    #[test]
    fn test_topics() {
        let topics = builder();

        assert_eq!(topics.root(), "homeassistant/device/aqualogic");
        assert_eq!(
            topics.discovery_topic(),
            "homeassistant/device/aqualogic/config"
        );
        assert_eq!(topics.state_topic(), "homeassistant/device/aqualogic/state");
        assert_eq!(
            topics.availability_topic(),
            "homeassistant/device/aqualogic/availability"
        );
        assert_eq!(
            topics.command_wildcard(),
            "homeassistant/device/aqualogic/+/set"
        );
        assert_eq!(topics.status_topic(), "homeassistant/status");
    }

    #[test]
    fn test_nested_prefix() {
        let topics = TopicBuilder::new("home/ha", "pool").unwrap();
        assert_eq!(topics.state_topic(), "home/ha/device/pool/state");
        assert_eq!(topics.status_topic(), "home/ha/status");
    }

    #[test]
    fn test_invalid_parts() {
        assert!(TopicBuilder::new("", "aqualogic").is_err());
        assert!(TopicBuilder::new("homeassistant", "").is_err());
        assert!(TopicBuilder::new("home/#", "aqualogic").is_err());
        assert!(TopicBuilder::new("homeassistant", "pool+").is_err());
        assert!(TopicBuilder::new("homeassistant", "a/b").is_err());
        assert!(TopicBuilder::new("/homeassistant", "aqualogic").is_err());
        assert!(TopicBuilder::new("home//assistant", "aqualogic").is_err());
    }
}
