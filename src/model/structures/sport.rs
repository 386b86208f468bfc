use bytes::BytesMut;
use postgres_types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// How a sport's scoreline maps to a margin-of-victory weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovStyle {
    /// Every game is a race to N points; the point spread carries signal.
    RallyPoint,
    /// Games are sets; only the set differential carries signal.
    SetBased
}

#[derive(
    Deserialize, Serialize, Display, EnumString, EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash, Default
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Sport {
    #[default]
    Badminton,
    Squash,
    Tennis,
    Padel,
    Pickleball
}

impl Sport {
    /// Rating scale of the sport. Larger β flattens the expected-win curve.
    pub fn beta(&self) -> f64 {
        match self {
            Sport::Badminton => 200.0,
            Sport::Squash => 210.0,
            Sport::Tennis => 230.0,
            Sport::Padel => 230.0,
            Sport::Pickleball => 220.0
        }
    }

    pub fn mov_style(&self) -> MovStyle {
        match self {
            Sport::Badminton | Sport::Squash | Sport::Pickleball => MovStyle::RallyPoint,
            Sport::Tennis | Sport::Padel => MovStyle::SetBased
        }
    }
}

impl ToSql for Sport {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        <String as ToSql>::to_sql(&self.to_string(), ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for Sport {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let s = <&str as FromSql>::from_sql(ty, raw)?;
        Ok(s.parse::<Sport>()?)
    }

    fn accepts(ty: &Type) -> bool {
        <&str as FromSql>::accepts(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for sport in [
            Sport::Badminton,
            Sport::Squash,
            Sport::Tennis,
            Sport::Padel,
            Sport::Pickleball
        ] {
            let name = sport.to_string();
            assert_eq!(name.parse::<Sport>().unwrap(), sport);
        }
    }

    #[test]
    fn test_mov_styles() {
        assert_eq!(Sport::Badminton.mov_style(), MovStyle::RallyPoint);
        assert_eq!(Sport::Pickleball.mov_style(), MovStyle::RallyPoint);
        assert_eq!(Sport::Tennis.mov_style(), MovStyle::SetBased);
        assert_eq!(Sport::Padel.mov_style(), MovStyle::SetBased);
    }
}
