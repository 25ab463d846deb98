//! Pure page → value extraction. Nothing here touches the network.

use chrono::NaiveDate;
use scraper::{Html, Selector};
use thiserror::Error;
use tipster_core::{CanonicalRaceId, Grade, RaceAttributes, Surface};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {detail}")]
    Selector { selector: String, detail: String },
    #[error("page links to no race")]
    NoRaceLink,
    #[error("race link carries a malformed id {0:?}")]
    MalformedRaceId(String),
}

/// Finds the first `race_id=` link on a prediction page. A link whose id is
/// not exactly twelve digits is reported rather than skipped, unless a
/// well-formed link appears later on the page.
pub fn parse_prediction_page(html: &str) -> Result<CanonicalRaceId, ExtractError> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;

    let mut malformed = None;
    for href in document.select(&links).filter_map(|a| a.value().attr("href")) {
        let Some((_, tail)) = href.split_once("race_id=") else {
            continue;
        };
        let candidate = leading_digits(tail);
        match CanonicalRaceId::parse(candidate) {
            Ok(id) => return Ok(id),
            Err(_) => {
                malformed.get_or_insert_with(|| candidate.to_string());
            }
        }
    }

    Err(malformed.map_or(ExtractError::NoRaceLink, ExtractError::MalformedRaceId))
}

/// Extracts race attributes from a race result page. Anything not found
/// with confidence stays `None`.
pub fn parse_race_page(html: &str) -> Result<RaceAttributes, ExtractError> {
    let document = Html::parse_document(html);

    let mut attrs = RaceAttributes {
        name: select_first_text(&document, ".RaceName")?,
        grade: select_first_attr(&document, ".RaceName [class*='Icon_GradeType']", "class")?
            .and_then(|classes| grade_from_icon_class(&classes)),
        race_date: select_first_text(&document, "title")?.and_then(|t| japanese_date(&t)),
        ..Default::default()
    };

    if let Some(conditions) = select_first_text(&document, ".RaceData01")? {
        if let Some((surface, distance)) = surface_and_distance(&conditions) {
            attrs.surface = Some(surface);
            attrs.distance_m = Some(distance);
        }
        attrs.track_condition = labelled_value(&conditions, "馬場:");
    }

    if let Some(meeting) = select_first_text(&document, ".RaceData02")? {
        attrs.venue = meeting_venue(&meeting);
        attrs.field_size = field_size(&meeting);
    }

    Ok(attrs)
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        detail: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>())))
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

fn grade_from_icon_class(classes: &str) -> Option<Grade> {
    classes
        .split_whitespace()
        .find_map(|class| match class.strip_prefix("Icon_GradeType")? {
            "1" => Some(Grade::G1),
            "2" => Some(Grade::G2),
            "3" => Some(Grade::G3),
            _ => None,
        })
}

fn leading_digits(text: &str) -> &str {
    let end = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    &text[..end]
}

fn trailing_number(text: &str) -> Option<u32> {
    let start = text.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    text[start..].parse().ok()
}

/// `芝2500m`, `ダ1200m`, `障3930m` inside a `/`-separated condition line.
fn surface_and_distance(conditions: &str) -> Option<(Surface, u32)> {
    conditions.split('/').find_map(|segment| {
        let distance = segment
            .match_indices('m')
            .find_map(|(idx, _)| trailing_number(&segment[..idx]).filter(|d| *d > 0))?;
        let surface = if segment.contains('障') {
            Surface::Jump
        } else if segment.contains('芝') {
            Surface::Turf
        } else if segment.contains('ダ') {
            Surface::Dirt
        } else {
            return None;
        };
        Some((surface, distance))
    })
}

fn labelled_value(text: &str, label: &str) -> Option<String> {
    let (_, rest) = text.split_once(label)?;
    let value: String = rest
        .trim_start()
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '/')
        .collect();
    text_or_none(&value)
}

/// Venue from a meeting line such as `5回 東京 2日目`.
fn meeting_venue(meeting: &str) -> Option<String> {
    meeting.match_indices('回').find_map(|(idx, marker)| {
        trailing_number(&meeting[..idx])?;
        let after = &meeting[idx + marker.len()..];
        let (middle, _) = after.split_once("日目")?;
        text_or_none(middle.trim().trim_end_matches(|c: char| c.is_ascii_digit()))
    })
}

fn field_size(meeting: &str) -> Option<u32> {
    meeting
        .match_indices('頭')
        .find_map(|(idx, _)| trailing_number(meeting[..idx].trim_end()).filter(|n| *n > 0))
}

/// First `YYYY年M月D日` in `text`.
fn japanese_date(text: &str) -> Option<NaiveDate> {
    text.match_indices('年').find_map(|(idx, marker)| {
        let year = trailing_number(&text[..idx]).filter(|y| *y >= 1000)?;
        let rest = &text[idx + marker.len()..];
        let (month, rest) = rest.split_once('月')?;
        let (day, _) = rest.split_once('日')?;
        NaiveDate::from_ymd_opt(
            i32::try_from(year).ok()?,
            month.trim().parse().ok()?,
            day.trim().parse().ok()?,
        )
    })
}
