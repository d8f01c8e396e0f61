//! System clock from the hardware RTC.
//!
//! The board has no network time at this point, so the system clock is set
//! from the PCF8523. The RTC is read twice so the second read lands right on
//! a second boundary. Failures are reported to the caller, who logs and
//! carries on: a wrong clock is not worth a reboot.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use log::info;

/// `_IOR('p', 0x09, struct rtc_time)`
const RTC_RD_TIME: libc::c_ulong = 0x8024_7009;

/// Give up if the seconds field does not move within this long.
const RTC_TICK_TIMEOUT: Duration = Duration::from_secs(3);

/// `struct rtc_time` from `<linux/rtc.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcTime {
    pub tm_sec: libc::c_int,
    pub tm_min: libc::c_int,
    pub tm_hour: libc::c_int,
    pub tm_mday: libc::c_int,
    pub tm_mon: libc::c_int,
    pub tm_year: libc::c_int,
    pub tm_wday: libc::c_int,
    pub tm_yday: libc::c_int,
    pub tm_isdst: libc::c_int,
}

impl RtcTime {
    /// Seconds since the epoch, treating the RTC as UTC.
    pub fn to_unix_time(&self) -> Option<i64> {
        let date = NaiveDate::from_ymd_opt(
            self.tm_year.checked_add(1900)?,
            u32::try_from(self.tm_mon.checked_add(1)?).ok()?,
            u32::try_from(self.tm_mday).ok()?,
        )?;
        let time = date.and_hms_opt(
            u32::try_from(self.tm_hour).ok()?,
            u32::try_from(self.tm_min).ok()?,
            u32::try_from(self.tm_sec).ok()?,
        )?;

        Some(time.and_utc().timestamp())
    }
}

impl fmt::Display for RtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
            self.tm_year + 1900,
            self.tm_mon + 1,
            self.tm_mday,
            self.tm_hour,
            self.tm_min,
            self.tm_sec
        )
    }
}

fn read_rtc(rtc: &File) -> io::Result<RtcTime> {
    let mut time = RtcTime::default();

    // SAFETY: RTC_RD_TIME fills a struct rtc_time, which RtcTime mirrors.
    let rc = unsafe { libc::ioctl(rtc.as_raw_fd(), RTC_RD_TIME as _, &mut time as *mut RtcTime) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(time)
}

fn set_system_time(seconds: i64) -> io::Result<()> {
    let now = libc::timespec {
        tv_sec: seconds as libc::time_t,
        tv_nsec: 0,
    };

    // SAFETY: now is a valid timespec.
    if unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &now) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Set the system clock from the RTC at `rtc_path`.
pub fn sync_system_clock(rtc_path: &Path) -> Result<()> {
    let rtc = File::open(rtc_path)
        .with_context(|| format!("could not open {} for reading", rtc_path.display()))?;

    let start = read_rtc(&rtc).context("could not read RTC time")?;
    let started_at = Instant::now();

    let now = loop {
        let now = read_rtc(&rtc).context("could not read RTC time")?;
        if now.tm_sec != start.tm_sec {
            break now;
        }
        if started_at.elapsed() > RTC_TICK_TIMEOUT {
            bail!("RTC time seems to be stuck, cannot set system time");
        }
        thread::sleep(Duration::from_millis(10));
    };

    let Some(seconds) = now.to_unix_time().filter(|s| *s >= 0) else {
        bail!("could not convert RTC time {} to system time", now);
    };

    set_system_time(seconds)
        .with_context(|| format!("could not use RTC time {} as system time", now))?;

    info!("using RTC time {} as system time", now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtc(year: i32, month: i32, day: i32, hour: i32, min: i32, sec: i32) -> RtcTime {
        RtcTime {
            tm_year: year - 1900,
            tm_mon: month - 1,
            tm_mday: day,
            tm_hour: hour,
            tm_min: min,
            tm_sec: sec,
            ..Default::default()
        }
    }

    #[test]
    fn test_epoch() {
        assert_eq!(rtc(1970, 1, 1, 0, 0, 0).to_unix_time(), Some(0));
    }

    #[test]
    fn test_known_dates() {
        assert_eq!(rtc(2020, 8, 27, 12, 0, 0).to_unix_time(), Some(1_598_529_600));
        assert_eq!(rtc(2000, 2, 29, 23, 59, 59).to_unix_time(), Some(951_868_799));
        assert_eq!(rtc(1969, 12, 31, 23, 59, 59).to_unix_time(), Some(-1));
    }

    #[test]
    fn test_garbage_month_rejected() {
        assert_eq!(rtc(2020, 13, 1, 0, 0, 0).to_unix_time(), None);
        assert_eq!(rtc(2020, 1, 0, 0, 0, 0).to_unix_time(), None);
    }

    #[test]
    fn test_impossible_dates_rejected() {
        assert_eq!(rtc(2021, 2, 31, 0, 0, 0).to_unix_time(), None);
        assert_eq!(rtc(2021, 2, 29, 0, 0, 0).to_unix_time(), None);
        assert_eq!(rtc(2021, 4, 30, 24, 0, 0).to_unix_time(), None);
        assert_eq!(rtc(2021, 4, 30, 23, 60, 0).to_unix_time(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(rtc(2021, 3, 4, 5, 6, 7).to_string(), "2021-03-04 05:06:07 UTC");
    }

    #[test]
    fn test_missing_rtc_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_system_clock(&dir.path().join("rtc0")).is_err());
    }
}
