//! Value encodings for the non-transfer characteristics.
//!
//! Decoders return `None` on short frames; callers log and drop those.

use crate::domain::models::{MotionSample, MusicEvent};
use chrono::{Datelike, NaiveDateTime, Timelike};

/// Current Time Service: exact time 256 + adjust reason.
pub fn encode_current_time(time: NaiveDateTime) -> [u8; 10] {
    let year = (time.year().clamp(0, u16::MAX as i32) as u16).to_le_bytes();
    let fractions = ((time.nanosecond() % 1_000_000_000) as u64 * 256 / 1_000_000_000) as u8;
    [
        year[0],
        year[1],
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second().min(59) as u8,
        time.weekday().number_from_monday() as u8,
        fractions,
        0, // adjust reason: manual time update
    ]
}

/// Alert notification as InfiniTime expects it: category, count, reserved, then `title\0body`.
pub fn encode_alert(title: &str, body: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(3 + title.len() + 1 + body.len());
    payload.extend_from_slice(&[0x00, 0x01, 0x00]);
    payload.extend_from_slice(title.as_bytes());
    payload.push(0);
    payload.extend_from_slice(body.as_bytes());
    payload
}

pub fn decode_battery(value: &[u8]) -> Option<u8> {
    value.first().map(|level| (*level).min(100))
}

/// Heart Rate Measurement: flag bit 0 selects a 16-bit value.
pub fn decode_heart_rate(value: &[u8]) -> Option<u16> {
    let flags = *value.first()?;
    if flags & 0x01 != 0 {
        let bytes = value.get(1..3)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    } else {
        value.get(1).map(|bpm| *bpm as u16)
    }
}

pub fn decode_step_count(value: &[u8]) -> Option<u32> {
    let bytes = value.get(0..4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn decode_motion(value: &[u8]) -> Option<MotionSample> {
    let bytes = value.get(0..6)?;
    Some(MotionSample {
        x: i16::from_le_bytes([bytes[0], bytes[1]]),
        y: i16::from_le_bytes([bytes[2], bytes[3]]),
        z: i16::from_le_bytes([bytes[4], bytes[5]]),
    })
}

pub fn decode_music_event(value: &[u8]) -> Option<MusicEvent> {
    match *value.first()? {
        0x00 => Some(MusicEvent::Play),
        0x01 => Some(MusicEvent::Pause),
        0x03 => Some(MusicEvent::Next),
        0x04 => Some(MusicEvent::Previous),
        0x05 => Some(MusicEvent::VolumeUp),
        0x06 => Some(MusicEvent::VolumeDown),
        0xe0 => Some(MusicEvent::Open),
        _ => None,
    }
}

/// Device information strings are UTF-8, sometimes NUL padded.
pub fn decode_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Paused = 0,
    Playing = 1,
}

/// Music position and track length are big-endian seconds.
pub fn encode_seconds(seconds: u32) -> [u8; 4] {
    seconds.to_be_bytes()
}

pub fn encode_playback_status(status: PlaybackStatus) -> [u8; 1] {
    [status as u8]
}

/// Navigation progress is a single percentage byte.
pub fn encode_navigation_progress(percent: u8) -> [u8; 1] {
    [percent.min(100)]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherIcon {
    Sun = 0,
    CloudsSun = 1,
    Clouds = 2,
    BrokenClouds = 3,
    CloudShowerHeavy = 4,
    CloudSunRain = 5,
    Thunderstorm = 6,
    Snow = 7,
    Smog = 8,
}

/// Current conditions for the simple weather service, temperatures in °C.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentWeather {
    pub timestamp: i64,
    pub temperature: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
    pub location: String,
    pub icon: WeatherIcon,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastDay {
    pub min_temperature: f32,
    pub max_temperature: f32,
    pub icon: WeatherIcon,
}

const WEATHER_LOCATION_LEN: usize = 32;
const WEATHER_MAX_FORECAST_DAYS: usize = 5;

fn centi_degrees(celsius: f32) -> [u8; 2] {
    let scaled = (celsius * 100.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    scaled.to_le_bytes()
}

impl CurrentWeather {
    /// Message type 0, version 0.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(49);
        payload.push(0x00);
        payload.push(0x00);
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        payload.extend_from_slice(&centi_degrees(self.temperature));
        payload.extend_from_slice(&centi_degrees(self.min_temperature));
        payload.extend_from_slice(&centi_degrees(self.max_temperature));

        let mut location = [0u8; WEATHER_LOCATION_LEN];
        let name = truncate_utf8(&self.location, WEATHER_LOCATION_LEN - 1);
        location[..name.len()].copy_from_slice(name.as_bytes());
        payload.extend_from_slice(&location);

        payload.push(self.icon as u8);
        payload
    }
}

/// Message type 1, version 0. At most five days are sent.
pub fn encode_forecast(timestamp: i64, days: &[ForecastDay]) -> Vec<u8> {
    let days = &days[..days.len().min(WEATHER_MAX_FORECAST_DAYS)];
    let mut payload = Vec::with_capacity(11 + days.len() * 5);
    payload.push(0x01);
    payload.push(0x00);
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.push(days.len() as u8);
    for day in days {
        payload.extend_from_slice(&centi_degrees(day.min_temperature));
        payload.extend_from_slice(&centi_degrees(day.max_temperature));
        payload.push(day.icon as u8);
    }
    payload
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
