use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::catalog::{Kit, UnitAxis};
use crate::model::{BucketKey, ColorChannel};

static CHANNEL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(?P<channel>[KCMY])\]$").expect("channel pattern compiles"));
static TRAY_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((?P<tray>[1-4](?:ST|ND|RD|TH) CST\.|SFB/BYPASS|O2-LCF|O-LCF|T-LCF|LCF)\)$")
        .expect("tray pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BucketError {
    #[error("kit {kit} is grouped per color but {code} carries no color channel")]
    MissingChannel { kit: String, code: String },
    #[error("kit {kit} is grouped per tray but {code} carries no tray position")]
    MissingTray { kit: String, code: String },
}

pub fn channel_of(code: &str) -> Option<ColorChannel> {
    CHANNEL_SUFFIX
        .captures(code)
        .and_then(|captures| captures.name("channel"))
        .and_then(|m| ColorChannel::from_letter(m.as_str()))
}

pub fn tray_of(code: &str) -> Option<String> {
    TRAY_SUFFIX
        .captures(code)
        .and_then(|captures| captures.name("tray"))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
}

fn is_drum(code: &str) -> bool {
    code.starts_with("DRUM[") && channel_of(code).is_some()
}

fn is_cassette(tray: &str) -> bool {
    tray.ends_with("CST")
}

pub fn bucket_key(code: &str, kit: &Kit) -> Result<BucketKey, BucketError> {
    let channel = || {
        channel_of(code).ok_or_else(|| BucketError::MissingChannel {
            kit: kit.code.clone(),
            code: code.to_string(),
        })
    };
    let tray = || {
        tray_of(code).ok_or_else(|| BucketError::MissingTray {
            kit: kit.code.clone(),
            code: code.to_string(),
        })
    };
    let key = |channel: Option<ColorChannel>, tray: Option<String>| BucketKey {
        kit: kit.code.clone(),
        channel,
        tray,
    };

    match kit.axis {
        UnitAxis::Single => Ok(key(None, None)),
        UnitAxis::PerColor => Ok(key(Some(channel()?), None)),
        UnitAxis::PerTray => Ok(key(None, Some(tray()?))),
        UnitAxis::PerColorAndTray => Ok(key(Some(channel()?), Some(tray()?))),
        UnitAxis::Auto => {
            if is_drum(code) {
                return Ok(key(channel_of(code), None));
            }
            match tray_of(code) {
                Some(tray) if is_cassette(&tray) => Ok(key(None, Some(tray))),
                _ => Ok(key(None, None)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kit(code: &str, axis: UnitAxis) -> Kit {
        Kit {
            code: code.to_string(),
            quantity: 1,
            axis,
            covers: vec!["placeholder".to_string()],
        }
    }

    #[test]
    fn auto_axis_splits_drums_per_channel() {
        let od = kit("OD-FC50", UnitAxis::Auto);
        let yellow = bucket_key("DRUM[Y]", &od).expect("drum bucket");
        let magenta = bucket_key("DRUM[M]", &od).expect("drum bucket");

        assert_eq!(yellow.channel, Some(ColorChannel::Y));
        assert_ne!(yellow, magenta);
    }

    #[test]
    fn auto_axis_splits_cassette_rollers_per_tray() {
        let feed = kit("ASYS-ROLL-FEED-CST", UnitAxis::Auto);
        let first_feed = bucket_key("FEED ROLLER (1ST CST.)", &feed).expect("bucket");
        let first_pick = bucket_key("PICK UP ROLLER (1ST CST.)", &feed).expect("bucket");
        let second = bucket_key("FEED ROLLER (2ND CST.)", &feed).expect("bucket");

        assert_eq!(first_feed, first_pick);
        assert_eq!(first_feed.tray.as_deref(), Some("1ST CST"));
        assert_ne!(first_feed, second);
    }

    #[test]
    fn auto_axis_keeps_everything_else_single() {
        let fuser = kit("FR-KIT-FC50", UnitAxis::Auto);
        let belt = bucket_key("FUSER BELT", &fuser).expect("bucket");
        let roller = bucket_key("PRESS ROLLER", &fuser).expect("bucket");
        assert_eq!(belt, roller);
        assert_eq!(belt.channel, None);
        assert_eq!(belt.tray, None);

        let bypass = bucket_key("FEED ROLLER (SFB/BYPASS)", &kit("SFB", UnitAxis::Auto))
            .expect("bucket");
        assert_eq!(bypass.tray, None);
    }

    #[test]
    fn explicit_axes_use_code_attributes() {
        let cleaning = kit("CLN-KIT-FC50", UnitAxis::PerColor);
        assert_eq!(
            bucket_key("GRID[C]", &cleaning).expect("bucket").channel,
            Some(ColorChannel::C)
        );

        let lcf = kit("ASYS-ROLL-FEED-LCF", UnitAxis::PerTray);
        assert_eq!(
            bucket_key("FEED ROLLER (O-LCF)", &lcf).expect("bucket").tray.as_deref(),
            Some("O-LCF")
        );

        let mixed = kit("MIXED", UnitAxis::PerColorAndTray);
        let err = bucket_key("DRUM[K]", &mixed).expect_err("drum has no tray");
        assert!(matches!(err, BucketError::MissingTray { .. }));
    }

    #[test]
    fn per_color_kit_rejects_codes_without_channel() {
        let cleaning = kit("CLN-KIT-FC50", UnitAxis::PerColor);
        let err = bucket_key("FUSER BELT", &cleaning).expect_err("no channel");
        assert_eq!(
            err,
            BucketError::MissingChannel {
                kit: "CLN-KIT-FC50".to_string(),
                code: "FUSER BELT".to_string(),
            }
        );
    }

    #[test]
    fn single_axis_ignores_channel() {
        let cleaning = kit("CLN-KIT-5018", UnitAxis::Single);
        assert_eq!(
            bucket_key("GRID[K]", &cleaning).expect("bucket"),
            bucket_key("SEPARATION FINGER (DRUM)", &cleaning).expect("bucket")
        );
    }
}
