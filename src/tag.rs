use std::cmp::Ordering;

/// A named pointer into history. Tags sort by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    id: String,
    name: String,
}

impl Tag {
    /// Builds a tag from the revision it points at and its name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Revision the tag points at.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tag name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_order_by_name() {
        let mut tags = vec![Tag::new("9", "v2.0"), Tag::new("3", "v0.1")];
        tags.sort();
        assert_eq!(tags[0].name(), "v0.1");
        assert_eq!(tags[1].id(), "9");
    }
}
