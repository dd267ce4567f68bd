//! Topics and subscriptions.
//!
//! A topic is a non-empty set of lowercase tags (`[a-z0-9_]+`). Topic `A`
//! contains topic `B` when every tag of `A` is also a tag of `B`, so the
//! general `{linux}` covers the more specific `{linux, news}`.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::constants::MAX_TOPIC_TAGS;
use crate::error::SubsError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    tags: BTreeSet<String>,
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

impl Topic {
    pub fn new<I, S>(tags: I) -> Result<Self, SubsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if !is_valid_tag(tag) {
                return Err(SubsError::InvalidTag(tag.to_string()));
            }
            set.insert(tag.to_string());
        }
        if set.is_empty() {
            return Err(SubsError::EmptyTopic);
        }
        if set.len() > MAX_TOPIC_TAGS {
            return Err(SubsError::TooManyTags(set.len()));
        }
        Ok(Self { tags: set })
    }

    /// Tags in canonical (sorted) order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// True when every tag of `self` is in `other`.
    pub fn contains(&self, other: &Topic) -> bool {
        self.tags.is_subset(&other.tags)
    }

    /// Every non-empty combination of this topic's tags. Bounded by
    /// `2^MAX_TOPIC_TAGS - 1`.
    pub fn combinations(&self) -> Vec<Topic> {
        let tags: Vec<&String> = self.tags.iter().collect();
        let n = tags.len();
        let mut out = Vec::with_capacity((1usize << n) - 1);
        for mask in 1u32..(1u32 << n) {
            let subset: BTreeSet<String> = tags
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, t)| (*t).clone())
                .collect();
            out.push(Topic { tags: subset });
        }
        out
    }

    /// SHA-1 of the canonical string form; the DHT key under which nodes
    /// interested in this exact tag set advertise themselves.
    pub fn info_hash(&self) -> [u8; 20] {
        let hash = Sha1::digest(self.to_string().as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash);
        out
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.tags().collect();
        write!(f, "{}", joined.join(","))
    }
}

impl FromStr for Topic {
    type Err = SubsError;

    /// Parse a comma-separated tag list such as `"linux,news"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(SubsError::EmptyTopic);
        }
        Topic::new(s.split(','))
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.tags.iter())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tags = Vec::<String>::deserialize(deserializer)?;
        Topic::new(tags).map_err(serde::de::Error::custom)
    }
}

/// An ordered list of topics the owner wants to receive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    topics: Vec<Topic>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_topics(topics: Vec<Topic>) -> Self {
        let mut subs = Self::new();
        for topic in topics {
            subs.add_topic(topic);
        }
        subs
    }

    /// Returns `false` if the topic was already present.
    pub fn add_topic(&mut self, topic: Topic) -> bool {
        if self.topics.contains(&topic) {
            return false;
        }
        self.topics.push(topic);
        true
    }

    /// Returns `false` if the topic was not present.
    pub fn remove_topic(&mut self, topic: &Topic) -> bool {
        let before = self.topics.len();
        self.topics.retain(|t| t != topic);
        self.topics.len() != before
    }

    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    /// True when some subscribed topic contains `topic`.
    pub fn covers(&self, topic: &Topic) -> bool {
        self.topics.iter().any(|t| t.contains(topic))
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Every distinct tag combination of every topic, used as DHT keys.
    pub fn to_combinations(&self) -> Vec<Topic> {
        let mut set = BTreeSet::new();
        for topic in &self.topics {
            set.extend(topic.combinations());
        }
        set.into_iter().collect()
    }

    /// One topic per line; blank lines and `#` comments are skipped.
    pub fn parse_lines(text: &str) -> Result<Self, SubsError> {
        let mut subs = Self::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            subs.add_topic(line.parse()?);
        }
        Ok(subs)
    }

    pub fn to_lines(&self) -> String {
        let mut out = String::new();
        for topic in &self.topics {
            out.push_str(&topic.to_string());
            out.push('\n');
        }
        out
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse_lines(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_lines())
    }
}

impl Serialize for Subscriptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.topics.iter().map(|t| t.to_string()))
    }
}

impl<'de> Deserialize<'de> for Subscriptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        let mut topics = Vec::with_capacity(raw.len());
        for s in raw {
            topics.push(s.parse::<Topic>().map_err(serde::de::Error::custom)?);
        }
        Ok(Subscriptions::from_topics(topics))
    }
}

impl fmt::Display for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.topics.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_canonical_order() {
        let t = topic("news, linux,news");
        assert_eq!(t.to_string(), "linux,news");
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_invalid_tags() {
        assert_eq!("".parse::<Topic>(), Err(SubsError::EmptyTopic));
        assert!(matches!("Linux".parse::<Topic>(), Err(SubsError::InvalidTag(_))));
        assert!(matches!("a,,b".parse::<Topic>(), Err(SubsError::InvalidTag(_))));
        assert!(matches!("c++".parse::<Topic>(), Err(SubsError::InvalidTag(_))));
        assert!("snake_case,v2".parse::<Topic>().is_ok());
    }

    #[test]
    fn test_containment() {
        let general = topic("linux");
        let specific = topic("linux,news");
        assert!(general.contains(&specific));
        assert!(!specific.contains(&general));
        assert!(general.contains(&general));
        assert!(!topic("bsd").contains(&specific));
    }

    #[test]
    fn test_combinations() {
        let combos = topic("linux,news").combinations();
        let strings: BTreeSet<String> = combos.iter().map(|t| t.to_string()).collect();
        let expected: BTreeSet<String> = ["linux", "news", "linux,news"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(strings, expected);
        assert_eq!(topic("a,b,c").combinations().len(), 7);
    }

    #[test]
    fn test_tag_count_capped() {
        let tags: Vec<String> = (0..MAX_TOPIC_TAGS).map(|i| format!("t{i}")).collect();
        let widest = Topic::new(&tags).unwrap();
        assert_eq!(widest.combinations().len(), (1 << MAX_TOPIC_TAGS) - 1);

        let mut more = tags.clone();
        more.push("extra".into());
        assert_eq!(
            Topic::new(&more),
            Err(SubsError::TooManyTags(MAX_TOPIC_TAGS + 1))
        );
        // Repeated tags collapse before the count.
        more.pop();
        more.push("t0".into());
        assert!(Topic::new(&more).is_ok());
    }

    #[test]
    fn test_info_hash_is_order_independent() {
        assert_eq!(topic("news,linux").info_hash(), topic("linux,news").info_hash());
        assert_ne!(topic("linux").info_hash(), topic("news").info_hash());
    }

    #[test]
    fn test_subscriptions_dedup_combinations() {
        let subs = Subscriptions::from_topics(vec![topic("linux,news"), topic("linux")]);
        let combos = subs.to_combinations();
        assert_eq!(combos.len(), 3);
    }

    #[test]
    fn test_covers_and_add_monotonic() {
        let mut subs = Subscriptions::from_topics(vec![topic("linux")]);
        let t = topic("linux,kernel");
        assert!(subs.covers(&t));
        assert!(subs.add_topic(topic("bsd")));
        assert!(subs.covers(&t));
        assert!(!subs.add_topic(topic("bsd")));
        assert!(!subs.covers(&topic("windows")));
    }

    #[test]
    fn test_remove_topic() {
        let mut subs = Subscriptions::from_topics(vec![topic("linux"), topic("bsd")]);
        assert!(subs.remove_topic(&topic("bsd")));
        assert!(!subs.remove_topic(&topic("bsd")));
        assert_eq!(subs.topics().len(), 1);
    }

    #[test]
    fn test_lines_roundtrip() {
        let text = "# my topics\nlinux,news\n\nrust\n";
        let subs = Subscriptions::parse_lines(text).unwrap();
        assert_eq!(subs.topics().len(), 2);
        assert_eq!(subs.to_lines(), "linux,news\nrust\n");
    }

    #[test]
    fn test_json_forms() {
        let t = topic("news,linux");
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"["linux","news"]"#);
        let subs = Subscriptions::from_topics(vec![t]);
        assert_eq!(serde_json::to_string(&subs).unwrap(), r#"["linux,news"]"#);
    }
}
