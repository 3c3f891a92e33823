//! Urgency assessment from assistant speech
//!
//! The model is told to call out obstacles with a distance. We pull the first
//! distance out of each assistant transcript, map it onto an urgency level,
//! and let that level drive how often frames are sent.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

const FEET_TO_METERS: f32 = 0.3048;

const NUMBER_WORDS: &str = "zero|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve\
    |thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|twenty|thirty|forty|fifty";

static DISTANCE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        r"(?ix)
        \b
        (?:
            (?:(?P<whole_num>\d+)|(?P<whole_word>{words}))\s+and\s+a\s+half\s+
          | (?P<half>half)\s+(?:a\s+)?
          | (?P<num>\d+(?:\.\d+)?)\s*-?\s*
          | (?P<word>{words})\s*-?\s*
        )
        (?P<unit>meters?|metres?|m|feet|foot|ft)
        \b",
        words = NUMBER_WORDS
    );
    Regex::new(&pattern).expect("distance pattern is valid")
});

static STOP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)stop|danger|\bwatch\s+out\b").expect("stop pattern is valid"));

static NAV_ENTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bnavigation\s+mode\b|\bstart\s+navigation\b|\bhelp\s+me\s+navigate\b")
        .expect("navigation pattern is valid")
});

static NAV_EXIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:stop|exit)\s+navigation\b").expect("navigation pattern is valid")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UrgencyLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl UrgencyLevel {
    pub fn from_distance(meters: f32) -> Self {
        if meters < 1.0 {
            UrgencyLevel::Critical
        } else if meters < 2.0 {
            UrgencyLevel::High
        } else if meters < 3.0 {
            UrgencyLevel::Medium
        } else {
            UrgencyLevel::Low
        }
    }

    /// Frame cadence while navigating at this level.
    pub fn frame_interval(self) -> Duration {
        match self {
            UrgencyLevel::Critical => Duration::from_millis(500),
            UrgencyLevel::High => Duration::from_millis(1000),
            UrgencyLevel::Medium => Duration::from_millis(1500),
            UrgencyLevel::Low => Duration::from_millis(2000),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UrgencyLevel::Low => "low",
            UrgencyLevel::Medium => "medium",
            UrgencyLevel::High => "high",
            UrgencyLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for UrgencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Assessment {
    pub distance_m: Option<f32>,
    pub urgency: Option<UrgencyLevel>,
    /// Bytes of the input up to the end of the last match used.
    pub consumed: usize,
}

fn word_value(word: &str) -> Option<f32> {
    let value = match word.to_ascii_lowercase().as_str() {
        "zero" => 0.0,
        "one" => 1.0,
        "two" => 2.0,
        "three" => 3.0,
        "four" => 4.0,
        "five" => 5.0,
        "six" => 6.0,
        "seven" => 7.0,
        "eight" => 8.0,
        "nine" => 9.0,
        "ten" => 10.0,
        "eleven" => 11.0,
        "twelve" => 12.0,
        "thirteen" => 13.0,
        "fourteen" => 14.0,
        "fifteen" => 15.0,
        "sixteen" => 16.0,
        "seventeen" => 17.0,
        "eighteen" => 18.0,
        "nineteen" => 19.0,
        "twenty" => 20.0,
        "thirty" => 30.0,
        "forty" => 40.0,
        "fifty" => 50.0,
        _ => return None,
    };
    Some(value)
}

/// First distance in `text` with the byte offset just past it.
fn find_distance(text: &str) -> Option<(f32, usize)> {
    let caps = DISTANCE.captures(text)?;
    let unit = caps.name("unit")?;
    let lower = unit.as_str().to_ascii_lowercase();
    let is_feet = matches!(lower.as_str(), "feet" | "foot" | "ft");

    let value = if let Some(whole) = caps.name("whole_num") {
        whole.as_str().parse::<f32>().ok()? + 0.5
    } else if let Some(whole) = caps.name("whole_word") {
        word_value(whole.as_str())? + 0.5
    } else if caps.name("half").is_some() {
        // Only metric halves are recognised
        if is_feet {
            return None;
        }
        0.5
    } else if let Some(num) = caps.name("num") {
        num.as_str().parse::<f32>().ok()?
    } else {
        word_value(caps.name("word")?.as_str())?
    };

    let meters = if is_feet { value * FEET_TO_METERS } else { value };
    Some((meters, unit.end()))
}

/// First distance mentioned in `text`, in meters.
pub fn parse_distance(text: &str) -> Option<f32> {
    find_distance(text).map(|(meters, _)| meters)
}

/// Derive distance and urgency from one assistant transcript.
///
/// A stop keyword anywhere forces critical regardless of any distance. Text
/// with neither yields no urgency so the previous level stays in effect.
pub fn assess(text: &str) -> Assessment {
    let found = find_distance(text);
    let stop = STOP.find(text);
    let urgency = if stop.is_some() {
        Some(UrgencyLevel::Critical)
    } else {
        found.map(|(meters, _)| UrgencyLevel::from_distance(meters))
    };
    let consumed = found
        .map(|(_, end)| end)
        .into_iter()
        .chain(stop.map(|m| m.end()))
        .max()
        .unwrap_or(0);
    Assessment {
        distance_m: found.map(|(meters, _)| meters),
        urgency,
        consumed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationTrigger {
    Enter,
    Exit,
}

/// Spoken request from the user to toggle navigation mode.
pub fn navigation_trigger(text: &str) -> Option<NavigationTrigger> {
    if NAV_EXIT.is_match(text) {
        Some(NavigationTrigger::Exit)
    } else if NAV_ENTER.is_match(text) {
        Some(NavigationTrigger::Enter)
    } else {
        None
    }
}
