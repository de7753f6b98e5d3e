use std::fmt;

use serde::{Deserialize, Serialize};

/// Message kind placeholder, e.g. `measurements`
pub const TYPE: &str = "$type";
/// Live data handler placeholder
pub const TARGET: &str = "$target";
/// Sensor id placeholder
pub const ID: &str = "$id";

/// A topic name with `$type`, `$target` and `$id` placeholders
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicTemplate(String);

impl TopicTemplate {
    #[inline]
    pub fn new<S: Into<String>>(template: S) -> Self {
        TopicTemplate(template.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn has_placeholder(&self, placeholder: &str) -> bool {
        self.0.contains(placeholder)
    }

    /// Substitutes every `(placeholder, value)` pair; placeholders not listed are left as is
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        vars.iter().fold(self.0.clone(), |topic, (placeholder, value)| topic.replace(placeholder, value))
    }
}

impl From<&str> for TopicTemplate {
    fn from(s: &str) -> Self {
        TopicTemplate::new(s)
    }
}

impl From<&String> for TopicTemplate {
    fn from(s: &String) -> Self {
        TopicTemplate::new(s.as_str())
    }
}

impl fmt::Debug for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
