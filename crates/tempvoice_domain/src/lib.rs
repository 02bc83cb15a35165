#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Errors for parsing identifiers and names from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid snowflake: {0}")]
	InvalidSnowflake(String),
	#[error("name too long: {len} characters (max {max})")]
	TooLong { len: usize, max: usize },
}

fn parse_snowflake(s: &str) -> Result<u64, ParseIdError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ParseIdError::Empty);
	}
	match s.parse::<u64>() {
		Ok(0) | Err(_) => Err(ParseIdError::InvalidSnowflake(s.to_string())),
		Ok(v) => Ok(v),
	}
}

macro_rules! snowflake_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
		pub struct $name(u64);

		impl $name {
			pub const fn new(raw: u64) -> Self {
				Self(raw)
			}

			pub const fn get(self) -> u64 {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				parse_snowflake(s).map(Self)
			}
		}

		// Snowflakes travel as JSON strings.
		#[cfg(feature = "serde")]
		impl serde::Serialize for $name {
			fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
			where
				S: serde::Serializer,
			{
				serializer.serialize_str(&self.0.to_string())
			}
		}

		#[cfg(feature = "serde")]
		impl<'de> serde::Deserialize<'de> for $name {
			fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
			where
				D: serde::Deserializer<'de>,
			{
				let s = String::deserialize(deserializer)?;
				s.parse().map_err(serde::de::Error::custom)
			}
		}
	};
}

snowflake_id!(
	/// Community (guild) identifier.
	CommunityId
);

snowflake_id!(
	/// Room (channel) identifier. Covers voice rooms, text rooms and direct-message rooms.
	RoomId
);

snowflake_id!(
	/// User identifier.
	UserId
);

snowflake_id!(
	/// Access role identifier.
	RoleId
);

snowflake_id!(
	/// Message identifier.
	MessageId
);

snowflake_id!(
	/// Application identifier used for command registration.
	ApplicationId
);

/// Validated room name (trimmed, 1..=100 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomName(String);

impl RoomName {
	pub const MAX_CHARS: usize = 100;

	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let len = name.chars().count();
		if len > Self::MAX_CHARS {
			return Err(ParseIdError::TooLong {
				len,
				max: Self::MAX_CHARS,
			});
		}
		Ok(Self(name.to_string()))
	}

	/// Room name for a user's ephemeral channel, truncated to fit.
	pub fn for_owner(display_name: &str) -> Self {
		const SUFFIX: &str = "'s channel";
		let display = display_name.trim();
		let display = if display.is_empty() { "Someone" } else { display };
		let budget = Self::MAX_CHARS - SUFFIX.chars().count();
		let owner: String = display.chars().take(budget).collect();
		Self(format!("{owner}{SUFFIX}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomName::new(s)
	}
}
