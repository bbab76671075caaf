use std::fmt;

/// Channel used to negotiate a new session.
pub const META_HANDSHAKE: &str = "/meta/handshake";
/// Channel carrying the long-poll heartbeat.
pub const META_CONNECT: &str = "/meta/connect";
/// Channel used to subscribe to a user channel.
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
/// Channel used to unsubscribe from a user channel.
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
/// Channel used to tear the session down.
pub const META_DISCONNECT: &str = "/meta/disconnect";

const META_PREFIX: &str = "/meta/";

/// Channel name rejected by [`ChannelId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid channel name: {0:?}")]
pub struct InvalidChannelName(pub String);

/// A validated Bayeux channel path such as `/foo/bar` or `/meta/connect`.
///
/// Wildcard channels are supported in the last segment only: `/foo/*` matches
/// direct children of `/foo`, `/foo/**` matches everything below `/foo`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    name: String,
    segments: Vec<String>,
}

impl ChannelId {
    /// Validates and splits a channel name.
    ///
    /// A valid name starts with `/`, has no empty segments, and uses `*` or
    /// `**` only as its last segment.
    pub fn parse(name: &str) -> Result<Self, InvalidChannelName> {
        if !name.starts_with('/') || name.len() < 2 || name.ends_with('/') {
            return Err(InvalidChannelName(name.to_string()))
        }
        let segments: Vec<String> = name[1..].split('/').map(str::to_string).collect();
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(InvalidChannelName(name.to_string()))
            }
            let is_last = i == segments.len() - 1;
            if (segment == "*" || segment == "**") && !is_last {
                return Err(InvalidChannelName(name.to_string()))
            }
        }
        Ok(Self { name: name.to_string(), segments })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_meta(&self) -> bool {
        self.name.starts_with(META_PREFIX)
    }

    /// `true` for both shallow (`/*`) and deep (`/**`) wildcards.
    pub fn is_wild(&self) -> bool {
        matches!(self.segments.last().map(String::as_str), Some("*") | Some("**"))
    }

    pub fn is_deep_wild(&self) -> bool {
        self.segments.last().map(String::as_str) == Some("**")
    }

    /// The wildcard channel names whose observers also see a message
    /// published to this (non-wild) channel: the shallow wild of the direct
    /// parent and the deep wild of every ancestor, most specific first.
    ///
    /// For `/a/b/c` this is `/a/b/*`, `/a/b/**`, `/a/**`, `/**`.
    pub fn wilds(&self) -> Vec<String> {
        if self.is_wild() {
            return Vec::new()
        }
        let mut wilds = Vec::with_capacity(self.depth() + 1);
        let parent = &self.name[..self.name.rfind('/').unwrap_or(0)];
        wilds.push(format!("{parent}/*"));
        for depth in (0..self.depth()).rev() {
            let prefix: String =
                self.segments[..depth].iter().map(|s| format!("/{s}")).collect();
            wilds.push(format!("{prefix}/**"));
        }
        wilds
    }

    /// Whether a message on `other` is visible on this channel. Exact
    /// channels match only themselves.
    pub fn matches(&self, other: &ChannelId) -> bool {
        if !self.is_wild() {
            return self == other
        }
        if other.is_wild() {
            return false
        }
        let prefix = &self.segments[..self.depth() - 1];
        let deep_enough = if self.is_deep_wild() {
            other.depth() > prefix.len()
        } else {
            other.depth() == self.depth()
        };
        deep_enough && other.segments.starts_with(prefix)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.name)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = InvalidChannelName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_validates_channel_names() {
        for ok in ["/foo", "/foo/bar", "/meta/connect", "/foo/*", "/foo/**", "/*", "/**"] {
            assert!(ChannelId::parse(ok).is_ok(), "{ok} should parse");
        }
        for bad in ["", "/", "foo", "/foo/", "//foo", "/foo//bar", "/*/foo", "/**/foo"] {
            assert!(ChannelId::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn it_classifies_channels() {
        let meta = ChannelId::parse(META_CONNECT).unwrap();
        assert!(meta.is_meta());
        assert!(!meta.is_wild());

        let shallow = ChannelId::parse("/foo/*").unwrap();
        assert!(shallow.is_wild());
        assert!(!shallow.is_deep_wild());

        let deep = ChannelId::parse("/foo/**").unwrap();
        assert!(deep.is_wild());
        assert!(deep.is_deep_wild());
    }

    #[test]
    fn it_computes_wilds() {
        let id = ChannelId::parse("/a/b/c").unwrap();
        assert_eq!(id.wilds(), vec!["/a/b/*", "/a/b/**", "/a/**", "/**"]);

        let top = ChannelId::parse("/foo").unwrap();
        assert_eq!(top.wilds(), vec!["/*", "/**"]);

        assert!(ChannelId::parse("/foo/*").unwrap().wilds().is_empty());
    }

    #[test]
    fn it_matches_wildcards() {
        let shallow = ChannelId::parse("/foo/*").unwrap();
        assert!(shallow.matches(&ChannelId::parse("/foo/bar").unwrap()));
        assert!(!shallow.matches(&ChannelId::parse("/foo/bar/baz").unwrap()));
        assert!(!shallow.matches(&ChannelId::parse("/foo").unwrap()));

        let deep = ChannelId::parse("/foo/**").unwrap();
        assert!(deep.matches(&ChannelId::parse("/foo/bar").unwrap()));
        assert!(deep.matches(&ChannelId::parse("/foo/bar/baz").unwrap()));
        assert!(!deep.matches(&ChannelId::parse("/other").unwrap()));

        let root = ChannelId::parse("/**").unwrap();
        assert!(root.matches(&ChannelId::parse("/anything/at/all").unwrap()));

        let exact = ChannelId::parse("/foo").unwrap();
        assert!(exact.matches(&ChannelId::parse("/foo").unwrap()));
        assert!(!exact.matches(&ChannelId::parse("/foo/bar").unwrap()));
    }
}
