//! Release quality flags and quality detection from release names.
//!
//! Qualities are bit flags so that a show's wanted-quality can be a mask
//! over several acceptable qualities. Ranking between concrete qualities
//! uses the numeric bit value as a total order (higher bit = better), which
//! is distinct from mask intersection and deliberately kept that way.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A quality value: either a single concrete quality, `UNKNOWN`, or a
/// composite mask of several qualities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quality(pub u32);

impl Quality {
    pub const SDTV: Quality = Quality(1);
    pub const SDDVD: Quality = Quality(1 << 1);
    pub const HDTV: Quality = Quality(1 << 2);
    /// 720p/1080i mpeg2 transport streams.
    pub const RAWHDTV: Quality = Quality(1 << 3);
    pub const FULLHDTV: Quality = Quality(1 << 4);
    pub const HDWEBDL: Quality = Quality(1 << 5);
    pub const FULLHDWEBDL: Quality = Quality(1 << 6);
    pub const HDBLURAY: Quality = Quality(1 << 7);
    pub const FULLHDBLURAY: Quality = Quality(1 << 8);

    // Kept far away from the real qualities so composites don't collide.
    pub const UNKNOWN: Quality = Quality(1 << 15);

    pub const SD: Quality = Quality(Self::SDTV.0 | Self::SDDVD.0);
    pub const HD720P: Quality = Quality(Self::HDTV.0 | Self::HDWEBDL.0 | Self::HDBLURAY.0);
    pub const HD1080P: Quality =
        Quality(Self::FULLHDTV.0 | Self::FULLHDWEBDL.0 | Self::FULLHDBLURAY.0);
    pub const HD: Quality = Quality(Self::HD720P.0 | Self::HD1080P.0 | Self::RAWHDTV.0);
    pub const ANY: Quality = Quality(Self::SD.0 | Self::HD.0 | Self::UNKNOWN.0);

    /// All single concrete qualities, best first.
    pub const SINGLES: [Quality; 10] = [
        Self::FULLHDBLURAY,
        Self::HDBLURAY,
        Self::FULLHDWEBDL,
        Self::HDWEBDL,
        Self::FULLHDTV,
        Self::RAWHDTV,
        Self::HDTV,
        Self::SDDVD,
        Self::SDTV,
        Self::UNKNOWN,
    ];

    /// True if this value has exactly one bit set.
    pub fn is_single(self) -> bool {
        self.0 != 0 && self.0 & (self.0 - 1) == 0
    }

    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN && self.0 != 0
    }

    /// True if any bit of `self` is inside `mask`.
    pub fn intersects(self, mask: Quality) -> bool {
        self.0 & mask.0 != 0
    }

    /// Ordinal used to rank concrete qualities against each other.
    pub fn rank(self) -> u32 {
        self.0
    }

    /// The single qualities contained in this mask, worst first.
    pub fn components(self) -> impl Iterator<Item = Quality> {
        Self::SINGLES
            .into_iter()
            .rev()
            .filter(move |q| q.intersects(self))
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::UNKNOWN => "Unknown",
            Self::SDTV => "SD TV",
            Self::SDDVD => "SD DVD",
            Self::HDTV => "HD TV",
            Self::RAWHDTV => "RawHD TV",
            Self::FULLHDTV => "1080p HD TV",
            Self::HDWEBDL => "720p WEB-DL",
            Self::FULLHDWEBDL => "1080p WEB-DL",
            Self::HDBLURAY => "720p BluRay",
            Self::FULLHDBLURAY => "1080p BluRay",
            Self::SD => "SD",
            Self::HD => "HD",
            Self::HD720P => "HD720p",
            Self::HD1080P => "HD1080p",
            Self::ANY => "ANY",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Quality({:#x})", self.0),
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

struct QualityRule {
    require: &'static [&'static str],
    exclude: Option<&'static str>,
    quality: Quality,
}

/// Detection rules tried in order; a rule matches when every `require`
/// pattern is found and the `exclude` pattern (if any) is not.
static QUALITY_RULES: Lazy<Vec<(Vec<Regex>, Option<Regex>, Quality)>> = Lazy::new(|| {
    let rules: &[QualityRule] = &[
        QualityRule {
            require: &[r"(pdtv|hdtv|dsr|tvrip|webrip).(xvid|x264)"],
            exclude: Some(r"(720|1080)[pi]"),
            quality: Quality::SDTV,
        },
        QualityRule {
            require: &[r"(dvdrip|bdrip)(.ws)?.(xvid|divx|x264)"],
            exclude: Some(r"(720|1080)[pi]"),
            quality: Quality::SDDVD,
        },
        QualityRule {
            require: &["720p", "hdtv", "x264"],
            exclude: None,
            quality: Quality::HDTV,
        },
        QualityRule {
            require: &[r"hr.ws.pdtv.x264"],
            exclude: Some(r"1080[pi]"),
            quality: Quality::HDTV,
        },
        QualityRule {
            require: &["720p|1080i", "hdtv", "mpeg-?2"],
            exclude: None,
            quality: Quality::RAWHDTV,
        },
        QualityRule {
            require: &["1080p", "hdtv", "x264"],
            exclude: None,
            quality: Quality::FULLHDTV,
        },
        QualityRule {
            require: &["720p", "web.dl|webrip"],
            exclude: None,
            quality: Quality::HDWEBDL,
        },
        QualityRule {
            require: &["720p", "itunes", "h.?264"],
            exclude: None,
            quality: Quality::HDWEBDL,
        },
        QualityRule {
            require: &["1080p", "web.dl|webrip"],
            exclude: None,
            quality: Quality::FULLHDWEBDL,
        },
        QualityRule {
            require: &["1080p", "itunes", "h.?264"],
            exclude: None,
            quality: Quality::FULLHDWEBDL,
        },
        QualityRule {
            require: &["720p", "bluray|hddvd", "x264"],
            exclude: None,
            quality: Quality::HDBLURAY,
        },
        QualityRule {
            require: &["1080p", "bluray|hddvd", "x264"],
            exclude: None,
            quality: Quality::FULLHDBLURAY,
        },
    ];

    rules
        .iter()
        .map(|rule| {
            let require = rule
                .require
                .iter()
                .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid quality pattern"))
                .collect();
            let exclude = rule
                .exclude
                .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid quality pattern"));
            (require, exclude, rule.quality)
        })
        .collect()
});

/// Literal quality labels we write into filenames ourselves, best first.
/// If one appears verbatim in a name, trust it over the detection rules.
static LABEL_PATTERNS: Lazy<Vec<(Regex, Quality)>> = Lazy::new(|| {
    let mut labels: Vec<(Regex, Quality)> = Vec::new();
    for q in Quality::SINGLES {
        if q == Quality::UNKNOWN {
            continue;
        }
        let name = q.name().unwrap_or_default().replace(' ', r"\W");
        let re = Regex::new(&format!(r"(?i)\W{name}\W")).expect("invalid label pattern");
        labels.push((re, q));
    }
    labels
});

/// Determine the quality of a release from its name.
///
/// `name` may be a bare release name or a full path; only the final
/// component is considered. When no rule matches and
/// `guess_from_extension` is set, fall back to a guess based on the file
/// extension.
pub fn quality_from_name(name: &str, guess_from_extension: bool) -> Quality {
    let name = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);

    for (re, quality) in LABEL_PATTERNS.iter() {
        if re.is_match(name) {
            return *quality;
        }
    }

    for (require, exclude, quality) in QUALITY_RULES.iter() {
        let all_found = require.iter().all(|re| re.is_match(name));
        if !all_found {
            continue;
        }
        if let Some(ex) = exclude {
            if ex.is_match(name) {
                continue;
            }
        }
        return *quality;
    }

    if guess_from_extension {
        return quality_from_extension(name);
    }

    Quality::UNKNOWN
}

fn quality_from_extension(name: &str) -> Quality {
    let lower = name.to_lowercase();
    if lower.ends_with(".avi") || lower.ends_with(".mp4") {
        Quality::SDTV
    } else if lower.ends_with(".mkv") {
        Quality::HDTV
    } else if lower.ends_with(".ts") {
        Quality::RAWHDTV
    } else {
        Quality::UNKNOWN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_values_are_stable() {
        assert_eq!(Quality::SDTV.0, 1);
        assert_eq!(Quality::SDDVD.0, 2);
        assert_eq!(Quality::HDTV.0, 4);
        assert_eq!(Quality::RAWHDTV.0, 8);
        assert_eq!(Quality::FULLHDTV.0, 16);
        assert_eq!(Quality::HDWEBDL.0, 32);
        assert_eq!(Quality::FULLHDWEBDL.0, 64);
        assert_eq!(Quality::HDBLURAY.0, 128);
        assert_eq!(Quality::FULLHDBLURAY.0, 256);
        assert_eq!(Quality::UNKNOWN.0, 1 << 15);
    }

    #[test]
    fn composites_cover_their_members() {
        assert!(Quality::SDTV.intersects(Quality::SD));
        assert!(Quality::SDDVD.intersects(Quality::SD));
        assert!(!Quality::HDTV.intersects(Quality::SD));
        assert!(Quality::HDTV.intersects(Quality::HD720P));
        assert!(Quality::FULLHDWEBDL.intersects(Quality::HD1080P));
        assert!(Quality::RAWHDTV.intersects(Quality::HD));
        assert!(Quality::UNKNOWN.intersects(Quality::ANY));
    }

    #[test]
    fn single_detection() {
        assert!(Quality::HDTV.is_single());
        assert!(Quality::UNKNOWN.is_single());
        assert!(!Quality::SD.is_single());
        assert!(!Quality(0).is_single());
    }

    #[test]
    fn detects_hdtv_720p() {
        assert_eq!(
            quality_from_name("Show.S01E01.720p.HDTV.x264-GRP.mkv", true),
            Quality::HDTV
        );
    }

    #[test]
    fn detects_sdtv() {
        assert_eq!(
            quality_from_name("Show.S01E01.HDTV.XviD-GRP.avi", true),
            Quality::SDTV
        );
        assert_eq!(
            quality_from_name("Show.S01E01.PDTV.x264-GRP", false),
            Quality::SDTV
        );
    }

    #[test]
    fn detects_sddvd() {
        assert_eq!(
            quality_from_name("Show.S01E01.DVDRip.XviD-GRP.avi", true),
            Quality::SDDVD
        );
    }

    #[test]
    fn detects_webdl() {
        assert_eq!(
            quality_from_name("Show.S01E01.720p.WEB-DL.H264-GRP.mkv", true),
            Quality::HDWEBDL
        );
        assert_eq!(
            quality_from_name("Show.S01E01.1080p.WEB-DL.AAC2.0.H.264-GRP", false),
            Quality::FULLHDWEBDL
        );
    }

    #[test]
    fn detects_bluray() {
        assert_eq!(
            quality_from_name("Show.S01E01.1080p.BluRay.x264-GRP.mkv", true),
            Quality::FULLHDBLURAY
        );
    }

    #[test]
    fn detects_rawhd() {
        assert_eq!(
            quality_from_name("Show.S01E01.1080i.HDTV.MPEG2-GRP.ts", true),
            Quality::RAWHDTV
        );
    }

    #[test]
    fn extension_fallback() {
        assert_eq!(quality_from_name("Show.S01E01.avi", true), Quality::SDTV);
        assert_eq!(quality_from_name("Show.S01E01.mkv", true), Quality::HDTV);
        assert_eq!(quality_from_name("Show.S01E01.ts", true), Quality::RAWHDTV);
        assert_eq!(
            quality_from_name("Show.S01E01.wmv", true),
            Quality::UNKNOWN
        );
        assert_eq!(quality_from_name("Show.S01E01.mkv", false), Quality::UNKNOWN);
    }

    #[test]
    fn label_fast_path_wins() {
        assert_eq!(
            quality_from_name("Foo - S01E02 - Pilot [720p BluRay].mkv", true),
            Quality::HDBLURAY
        );
    }

    #[test]
    fn path_is_reduced_to_basename() {
        assert_eq!(
            quality_from_name("/downloads/done/Show.S01E01.720p.HDTV.x264/file.mkv", true),
            Quality::HDTV
        );
    }

    #[test]
    fn display_names() {
        assert_eq!(Quality::HDTV.to_string(), "HD TV");
        assert_eq!(Quality::SD.to_string(), "SD");
        assert_eq!(Quality::ANY.to_string(), "ANY");
        assert_eq!(Quality(6).to_string(), "Quality(0x6)");
    }

    #[test]
    fn components_of_masks() {
        let hd720: Vec<Quality> = Quality::HD720P.components().collect();
        assert_eq!(
            hd720,
            vec![Quality::HDTV, Quality::HDWEBDL, Quality::HDBLURAY]
        );
    }
}
