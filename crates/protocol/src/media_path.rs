//! `"<cname>/<track-label>/<kind>"`: the universal key for RTP producers and
//! consumers (spec §3 Media path, glossary).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaPath {
    pub cname: String,
    pub track_label: String,
    pub kind: MediaKind,
}

impl MediaPath {
    pub fn new(cname: impl Into<String>, track_label: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            cname: cname.into(),
            track_label: track_label.into(),
            kind,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '/');
        let cname = parts.next()?;
        let track_label = parts.next()?;
        let kind = parts.next()?.parse().ok()?;
        if cname.is_empty() || track_label.is_empty() {
            return None;
        }
        Some(Self::new(cname, track_label, kind))
    }
}

impl fmt::Display for MediaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cname, self.track_label, self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_display_and_parse() {
        let p = MediaPath::new("peer-1", "cam0", MediaKind::Video);
        let s = p.to_string();
        assert_eq!(s, "peer-1/cam0/video");
        assert_eq!(MediaPath::parse(&s).unwrap(), p);
    }

    #[test]
    fn rejects_malformed_path() {
        assert!(MediaPath::parse("no-slashes-here").is_none());
        assert!(MediaPath::parse("cname/label/screen").is_none());
        assert!(MediaPath::parse("/label/video").is_none());
    }
}
