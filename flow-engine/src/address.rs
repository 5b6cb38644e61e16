// Node Addresses
// Hierarchical identifiers for graph nodes with a canonical string form

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Root segment for step addresses
pub const STEP_ROOT: &str = "step";

/// Root segment for resource addresses
pub const RESOURCE_ROOT: &str = "resource";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("empty segment at position {position} in '{input}'")]
    EmptySegment { input: String, position: usize },

    #[error("malformed index in segment '{segment}'")]
    MalformedIndex { segment: String },
}

/// One path segment, optionally carrying an instance index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    pub name: String,
    pub index: Option<usize>,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
        }
    }

    pub fn indexed(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index: Some(index),
        }
    }

    fn parse(raw: &str) -> Result<Self, AddressError> {
        let malformed = || AddressError::MalformedIndex {
            segment: raw.to_string(),
        };

        match raw.find('[') {
            None => {
                if raw.contains(']') {
                    return Err(malformed());
                }
                Ok(Self::new(raw))
            }
            Some(open) => {
                let name = &raw[..open];
                let digits = raw[open + 1..].strip_suffix(']').ok_or_else(malformed)?;
                if name.is_empty()
                    || digits.is_empty()
                    || !digits.chars().all(|c| c.is_ascii_digit())
                {
                    return Err(malformed());
                }
                let index = digits.parse().map_err(|_| malformed())?;
                Ok(Self::indexed(name, index))
            }
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]", self.name, index),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Structured, hierarchical identifier for a node (or a path into a node's output)
///
/// The canonical string form joins segments with `.` and suffixes `[index]`
/// when a segment carries an instance index, e.g. `step.http.fetch[2]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    segments: Vec<Segment>,
}

impl Address {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Address of a step instance: `step.<type>.<name>[index]?`
    pub fn step(step_type: &str, name: &str, index: Option<usize>) -> Self {
        Self::new(vec![
            Segment::new(STEP_ROOT),
            Segment::new(step_type),
            Segment {
                name: name.to_string(),
                index,
            },
        ])
    }

    /// Address of a resource: `resource.<type>.<name>`
    pub fn resource(resource_type: &str, name: &str) -> Self {
        Self::new(vec![
            Segment::new(RESOURCE_ROOT),
            Segment::new(resource_type),
            Segment::new(name),
        ])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn root(&self) -> Option<&str> {
        self.segments.first().map(|s| s.name.as_str())
    }

    /// Index carried by the last segment
    pub fn index(&self) -> Option<usize> {
        self.segments.last().and_then(|s| s.index)
    }

    /// Same address with the instance index of the last segment replaced
    pub fn with_index(&self, index: Option<usize>) -> Self {
        let mut segments = self.segments.clone();
        if let Some(last) = segments.last_mut() {
            last.index = index;
        }
        Self { segments }
    }

    /// Leading `len` segments
    pub fn prefix(&self, len: usize) -> Self {
        Self {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    /// Segments after the leading `len`
    pub fn suffix(&self, len: usize) -> &[Segment] {
        &self.segments[len.min(self.segments.len())..]
    }

    /// Whether this path points into the step or resource namespace
    pub fn is_node_path(&self) -> bool {
        self.segments.len() >= 3 && matches!(self.root(), Some(STEP_ROOT) | Some(RESOURCE_ROOT))
    }

    pub fn is_step(&self) -> bool {
        self.root() == Some(STEP_ROOT)
    }

    pub fn is_resource(&self) -> bool {
        self.root() == Some(RESOURCE_ROOT)
    }

    /// Type segment of a node address (`http` in `step.http.fetch`)
    pub fn node_type(&self) -> Option<&str> {
        self.segments.get(1).map(|s| s.name.as_str())
    }

    /// Instance name segment of a node address (`fetch` in `step.http.fetch`)
    pub fn node_name(&self) -> Option<&str> {
        self.segments.get(2).map(|s| s.name.as_str())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(AddressError::Empty);
        }

        let segments = input
            .split('.')
            .enumerate()
            .map(|(position, raw)| {
                if raw.is_empty() {
                    Err(AddressError::EmptySegment {
                        input: input.to_string(),
                        position,
                    })
                } else {
                    Segment::parse(raw)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_address() {
        let addr: Address = "step.http.fetch".parse().unwrap();
        assert_eq!(addr.len(), 3);
        assert_eq!(addr.root(), Some("step"));
        assert_eq!(addr.node_type(), Some("http"));
        assert_eq!(addr.node_name(), Some("fetch"));
        assert_eq!(addr.index(), None);
        assert_eq!(addr, Address::step("http", "fetch", None));
    }

    #[test]
    fn test_parse_indexed_address() {
        let addr: Address = "step.http.fetch[12]".parse().unwrap();
        assert_eq!(addr.index(), Some(12));
        assert_eq!(addr.to_string(), "step.http.fetch[12]");
    }

    #[test]
    fn test_round_trip() {
        let inputs = [
            "resource.db.main",
            "step.http.fetch[0]",
            "step.http.fetch[3].output.body",
            "a",
            "a[1].b[2].c",
            "index",
        ];

        for input in inputs {
            let parsed: Address = input.parse().unwrap();
            let reparsed: Address = parsed.to_string().parse().unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {}", input);
            assert_eq!(parsed.to_string(), input);
        }
    }

    #[test]
    fn test_malformed_addresses() {
        assert_eq!("".parse::<Address>(), Err(AddressError::Empty));
        assert!(matches!(
            "step..fetch".parse::<Address>(),
            Err(AddressError::EmptySegment { position: 1, .. })
        ));
        assert!("step.fetch[".parse::<Address>().is_err());
        assert!("step.fetch[]".parse::<Address>().is_err());
        assert!("step.fetch[-1]".parse::<Address>().is_err());
        assert!("step.fetch[1]x".parse::<Address>().is_err());
        assert!("step.[1]".parse::<Address>().is_err());
        assert!("step.fetch]".parse::<Address>().is_err());
    }

    #[test]
    fn test_equality_ignores_nothing() {
        let a = Address::step("http", "fetch", Some(0));
        let b = Address::step("http", "fetch", None);
        assert_ne!(a, b);
        assert_eq!(a.with_index(None), b);
    }

    #[test]
    fn test_prefix_and_suffix() {
        let addr: Address = "step.http.fetch[1].output.body".parse().unwrap();
        assert!(addr.is_node_path());
        assert_eq!(addr.prefix(3), Address::step("http", "fetch", Some(1)));
        let rest: Vec<_> = addr.suffix(3).iter().map(|s| s.name.as_str()).collect();
        assert_eq!(rest, vec!["output", "body"]);

        let env: Address = "env.HOME".parse().unwrap();
        assert!(!env.is_node_path());
    }

    #[test]
    fn test_serde_as_string() {
        let addr = Address::resource("db", "main");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"resource.db.main\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
