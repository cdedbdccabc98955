//! Scene release-name matching.
//!
//! A battery of patterns tried in order of specificity, like the filename
//! conventions release groups actually use. Matching is pure string work;
//! resolving a matched series name to a real show happens in the parser
//! one level up.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

/// Raw result of matching a release name against the battery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMatch {
    pub series_name: Option<String>,
    pub season: Option<u32>,
    pub episodes: Vec<u32>,
    pub air_date: Option<NaiveDate>,
    pub extra_info: Option<String>,
    pub release_group: Option<String>,
    /// Name of the pattern that matched, for logging.
    pub pattern: &'static str,
}

struct ScenePattern {
    name: &'static str,
    regex: Lazy<Regex>,
}

macro_rules! pattern {
    ($name:literal, $re:literal) => {
        ScenePattern {
            name: $name,
            regex: Lazy::new(|| Regex::new($re).expect(concat!($name, " pattern"))),
        }
    };
}

// Order matters: multi-episode and repeated forms must win over their
// single-episode prefixes.
static PATTERNS: [ScenePattern; 11] = [
    // Show.Name.S01E02.S01E03
    pattern!(
        "standard_repeat",
        r"(?i)^(?P<series_name>.+?)[. _-]+s(?P<season_num>\d{1,2})[. _-]*e(?P<ep_num>\d{1,3})(?:[. _-]+s\d{1,2}[. _-]*e(?P<extra_ep_num>\d{1,3}))+(?P<tail>[. _-].*)?$"
    ),
    // Show.Name.1x02.1x03
    pattern!(
        "fov_repeat",
        r"(?i)^(?P<series_name>.+?)[. _-]+(?P<season_num>\d{1,2})x(?P<ep_num>\d{1,3})(?:[. _-]+\d{1,2}x(?P<extra_ep_num>\d{1,3}))+(?P<tail>[. _-].*)?$"
    ),
    // Show.Name.S01E02, S01E02E03, S01E02-E03, S01E02-04
    pattern!(
        "standard",
        r"(?i)^(?P<series_name>.+?)[. _-]+s(?P<season_num>\d{1,2})[. _-]*e(?P<ep_num>\d{1,3})(?:(?:[. _-]*(?:and[. _-]+|&[. _-]*)?e|-e)(?P<extra_ep_num>\d{1,3}))*(?:-(?P<ep_range_end>\d{1,2}))?(?P<tail>[. _-].*)?$"
    ),
    // Show.Name.1x02, 1x02x03, 1x02-03
    pattern!(
        "fov",
        r"(?i)^(?P<series_name>.+?)[\[. _-]+(?P<season_num>\d{1,2})x(?P<ep_num>\d{1,3})(?:[. _-]*x(?P<extra_ep_num>\d{1,3}))*(?:-(?P<ep_range_end>\d{1,2}))?(?P<tail>[\]. _-].*)?$"
    ),
    // Show.Name.2010.11.23 (daily shows)
    pattern!(
        "scene_date_format",
        r"(?i)^(?P<series_name>.+?)[. _-]+(?P<air_year>\d{4})[. _-]+(?P<air_month>\d{2})[. _-]+(?P<air_day>\d{2})(?P<tail>[. _-].*)?$"
    ),
    // Show Name - Season 1 Episode 2
    pattern!(
        "verbose",
        r"(?i)^(?P<series_name>.+?)[. _-]+season[. _-]+(?P<season_num>\d{1,2})[. _-]+episode[. _-]+(?P<ep_num>\d{1,3})(?P<tail>[. _-].*)?$"
    ),
    // Show Name Series 3 Ep 4 (documentary / UK style)
    pattern!(
        "mvgroup",
        r"(?i)^(?P<series_name>.+?)[. _-]+s(?:eries|eason)[. _-]?(?P<season_num>\d{1,2})[. _-]+(?:e|ep|episode)[. _-]?(?P<ep_num>\d{1,3})(?P<tail>[. _-].*)?$"
    ),
    // group-showname.0102 (the "stupid" form; guarded in code)
    pattern!(
        "stupid",
        r"(?i)^(?P<release_group>.+?)-(?P<series_name>\w+?)[. ]?(?P<season_num>\d{1,2})(?P<ep_num>\d{2})$"
    ),
    // Show Name - E02-E03 (no season)
    pattern!(
        "no_season_multi_ep",
        r"(?i)^(?P<series_name>.+?)[. _-]+(?:e|ep)[. _-]?(?P<ep_num>\d{1,3})(?:[. _-]*(?:-|&|and)[. _-]*(?:e|ep)?[. _-]?(?P<extra_ep_num>\d{1,3}))+(?P<tail>[. _-].*)?$"
    ),
    // Show Name - Part 2 / Part II (no season)
    pattern!(
        "no_season_general",
        r"(?i)^(?P<series_name>.+?)[. _-]+(?:part|pt)[. _-]?(?:(?P<ep_num>\d{1,2})|(?P<ep_roman>[ivx]{1,5}))(?P<tail>[. _-].*)?$"
    ),
    // Show Name - E02 (no season)
    pattern!(
        "no_season",
        r"(?i)^(?P<series_name>.+?)[. _-]+(?:e|ep)[. _-]?(?P<ep_num>\d{1,3})(?P<tail>[. _-].*)?$"
    ),
];

static SITE_AT_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[[^\]]+\][. _-]*(?P<rest>.+)$").expect("site prefix pattern"));

// Words that mark a release as something we never want, no matter the show.
static BAD_RELEASE_WORDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"sub(bed|pack|s)",
        r"(dir|sample|sub|nfo)fix",
        r"(dvd)?extras",
        r"dub(bed)?",
        r"german",
        r"french",
        r"spanish",
        r"italian",
        r"swedish",
        r"danish",
        r"dutch",
        r"swesub",
        r"korsub",
    ]
    .iter()
    .map(|w| Regex::new(&format!(r"(?i)(^|[\W_])(?:{w})($|[\W_])")).expect("bad-release word"))
    .collect()
});

/// True when the release name contains a marker we always reject
/// (subtitle packs, samples, foreign dubs, extras discs).
pub fn is_bad_release(name: &str) -> bool {
    BAD_RELEASE_WORDS.iter().any(|re| re.is_match(name))
}

/// Match a release name against the battery. The name must already have
/// its file extension stripped.
pub fn match_release(name: &str) -> Option<NameMatch> {
    let name = name.trim();
    // Anime-style "[site] Show Name ..." prefixes carry no information.
    let name = match SITE_AT_START.captures(name) {
        Some(caps) => caps.name("rest").map(|m| m.as_str()).unwrap_or(name),
        None => name,
    };

    for pattern in &PATTERNS {
        let Some(caps) = pattern.regex.captures(name) else {
            continue;
        };

        let season = named_u32(&caps, "season_num");
        let first_ep = named_u32(&caps, "ep_num").or_else(|| {
            caps.name("ep_roman")
                .and_then(|m| roman_to_u32(m.as_str()))
        });
        let last_ep = named_u32(&caps, "extra_ep_num")
            .into_iter()
            .chain(named_u32(&caps, "ep_range_end"))
            .max();

        // The bare group-name.0102 form is ambiguous with codec and
        // resolution tokens; reject those outright.
        if pattern.name == "stupid" {
            let combined = format!(
                "{}{:02}",
                caps.name("season_num").map(|m| m.as_str()).unwrap_or(""),
                first_ep.unwrap_or(0)
            );
            if matches!(combined.as_str(), "264" | "265" | "480" | "720" | "1080" | "2160") {
                continue;
            }
        }

        let air_date = match (
            named_u32(&caps, "air_year"),
            named_u32(&caps, "air_month"),
            named_u32(&caps, "air_day"),
        ) {
            (Some(y), Some(m), Some(d)) => {
                match NaiveDate::from_ymd_opt(y as i32, m, d) {
                    Some(date) => Some(date),
                    // Not a real date, so not a daily-show name.
                    None => continue,
                }
            }
            _ => None,
        };

        let episodes = match (first_ep, last_ep) {
            (Some(first), Some(last)) if last > first => (first..=last).collect(),
            (Some(first), _) => vec![first],
            (None, _) => Vec::new(),
        };
        if episodes.is_empty() && air_date.is_none() {
            continue;
        }

        let (extra_info, release_group) = match caps.name("release_group") {
            Some(g) => (None, Some(g.as_str().to_string())),
            None => split_tail(caps.name("tail").map(|m| m.as_str()).unwrap_or("")),
        };

        return Some(NameMatch {
            series_name: caps
                .name("series_name")
                .map(|m| clean_series_name(m.as_str())),
            season,
            episodes,
            air_date,
            extra_info,
            release_group,
            pattern: pattern.name,
        });
    }

    None
}

fn named_u32(caps: &regex::Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

/// Split the text after the episode numbers into extra info and a release
/// group. The group is the token after the last dash, when it looks like
/// a group tag rather than part of the info (no separators inside, not a
/// source marker like WEB-DL's "DL").
fn split_tail(tail: &str) -> (Option<String>, Option<String>) {
    let tail = tail.trim_matches(|c: char| c == '.' || c == ' ' || c == '_' || c == '-');
    if tail.is_empty() {
        return (None, None);
    }

    if let Some(idx) = tail.rfind('-') {
        let candidate = &tail[idx + 1..];
        let before = &tail[..idx];
        let group_like = !candidate.is_empty()
            && candidate.chars().all(|c| c.is_ascii_alphanumeric())
            && !matches!(
                candidate.to_ascii_uppercase().as_str(),
                "DL" | "WEB" | "RIP" | "HD"
            )
            && !before.ends_with([' ', '.', '_', '-']);
        if group_like {
            let extra = before.trim_matches(|c: char| c == '.' || c == ' ' || c == '_');
            return (
                (!extra.is_empty()).then(|| extra.to_string()),
                Some(candidate.to_string()),
            );
        }
    }

    (Some(tail.to_string()), None)
}

/// Turn a dotted/underscored series name into plain words. Dots between
/// digits are kept ("Heroes.24.7" style decimals), except when the right
/// side is a year.
pub fn clean_series_name(name: &str) -> String {
    let chars: Vec<char> = name.replace('_', " ").chars().collect();
    let mut out = String::with_capacity(chars.len());

    for (i, &c) in chars.iter().enumerate() {
        if c != '.' {
            out.push(c);
            continue;
        }
        let prev_digit = i > 0 && chars[i - 1].is_ascii_digit();
        let next_digit = chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
        let next_is_year = chars.len() >= i + 5
            && chars[i + 1..i + 5].iter().all(|c| c.is_ascii_digit())
            && !chars.get(i + 5).is_some_and(|c| c.is_ascii_digit());
        if prev_digit && next_digit && !next_is_year {
            out.push('.');
        } else {
            out.push(' ');
        }
    }

    out.trim().trim_end_matches('-').trim().to_string()
}

/// Collapse a show name to its comparable core: lowercase ascii
/// alphanumerics only. Both sides of every name comparison go through
/// this, so punctuation, case, and spacing never matter.
pub fn simplify_show_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn roman_to_u32(s: &str) -> Option<u32> {
    let value = |c: char| match c.to_ascii_lowercase() {
        'i' => Some(1),
        'v' => Some(5),
        'x' => Some(10),
        _ => None,
    };
    let digits: Option<Vec<u32>> = s.chars().map(value).collect();
    let digits = digits?;
    let mut total = 0i64;
    for (i, &d) in digits.iter().enumerate() {
        if digits[i + 1..].iter().any(|&next| next > d) {
            total -= d as i64;
        } else {
            total += d as i64;
        }
    }
    (total > 0).then_some(total as u32)
}
