//! Environment self-test.
//!
//! Mirrors what operators run before trusting a deployment: database
//! reachability with the configured URL, and the timezone database's
//! daylight-saving rules. The DST check pins America/Chicago across the
//! 2020 transitions because an image with broken tzdata corrupts schedule
//! math silently; better to fail loudly here.

use crate::config::Config;
use chrono::{Offset, TimeZone};
use chrono_tz::America::Chicago;
use sqlx::PgPool;

const STANDARD_OFFSET: i32 = -21600;
const DAYLIGHT_OFFSET: i32 = -18000;

/// Run all checks, printing one OK/FAIL line each. Returns whether every
/// check passed.
pub async fn run(config: Option<&Config>, offline: bool) -> bool {
    let mut failed = false;
    let mut result = |name: &str, outcome: Result<(), String>| match outcome {
        Ok(()) => println!("{name}: OK"),
        Err(err) => {
            failed = true;
            println!("{name}: FAIL ({err})");
        }
    };

    if let Some(config) = config {
        if !offline {
            result("DB", check_db(&config.db_url).await);
            if let Some(next_url) = &config.db_url_next {
                result("DB (next)", check_db(next_url).await);
            }
        }
    }

    result("DST Rules", check_dst());

    !failed
}

async fn check_db(url: &str) -> Result<(), String> {
    let pool = PgPool::connect(url).await.map_err(|err| err.to_string())?;
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
    pool.close().await;
    Ok(())
}

fn check_dst() -> Result<(), String> {
    let spring = Chicago
        .with_ymd_and_hms(2020, 3, 8, 0, 0, 0)
        .single()
        .ok_or("ambiguous 2020-03-08 midnight")?;
    expect_offset(spring.offset().fix().local_minus_utc(), STANDARD_OFFSET)?;
    expect_offset(
        (spring + chrono::Duration::hours(3))
            .offset()
            .fix()
            .local_minus_utc(),
        DAYLIGHT_OFFSET,
    )?;

    let fall = Chicago
        .with_ymd_and_hms(2020, 11, 1, 0, 0, 0)
        .single()
        .ok_or("ambiguous 2020-11-01 midnight")?;
    expect_offset(fall.offset().fix().local_minus_utc(), DAYLIGHT_OFFSET)?;
    expect_offset(
        (fall + chrono::Duration::hours(3))
            .offset()
            .fix()
            .local_minus_utc(),
        STANDARD_OFFSET,
    )?;
    Ok(())
}

fn expect_offset(got: i32, want: i32) -> Result<(), String> {
    if got != want {
        return Err(format!("invalid offset: got {got}; want {want}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_rules_hold_for_chicago_2020() {
        assert_eq!(check_dst(), Ok(()));
    }

    #[test]
    fn spring_forward_shifts_by_an_hour() {
        let before = Chicago.with_ymd_and_hms(2020, 3, 8, 0, 30, 0).single().unwrap();
        let after = before + chrono::Duration::hours(3);
        assert_eq!(before.offset().fix().local_minus_utc(), STANDARD_OFFSET);
        assert_eq!(after.offset().fix().local_minus_utc(), DAYLIGHT_OFFSET);
    }

    #[test]
    fn fall_back_restores_standard_time() {
        let before = Chicago.with_ymd_and_hms(2020, 11, 1, 0, 30, 0).single().unwrap();
        let after = before + chrono::Duration::hours(3);
        assert_eq!(before.offset().fix().local_minus_utc(), DAYLIGHT_OFFSET);
        assert_eq!(after.offset().fix().local_minus_utc(), STANDARD_OFFSET);
    }
}
