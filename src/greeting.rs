//! Startup greeting spoken as its own turn.

use chrono::{Local, NaiveDateTime, Timelike};

pub fn greeting(user_name: &str) -> String {
    greeting_at(user_name, Local::now().naive_local())
}

pub fn greeting_at(user_name: &str, at: NaiveDateTime) -> String {
    let part_of_day = match at.hour() {
        0..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    };
    format!("Good {part_of_day} {user_name}, happy {}.", at.format("%A"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        // 2024-07-01 was a Monday
        NaiveDate::from_ymd_opt(2024, 7, day)
            .unwrap()
            .and_hms_opt(hour, 30, 0)
            .unwrap()
    }

    #[test]
    fn part_of_day_and_weekday() {
        assert_eq!(greeting_at("Dave", at(1, 8)), "Good morning Dave, happy Monday.");
        assert_eq!(greeting_at("Dave", at(3, 12)), "Good afternoon Dave, happy Wednesday.");
        assert_eq!(greeting_at("Ada", at(5, 23)), "Good evening Ada, happy Friday.");
    }
}
