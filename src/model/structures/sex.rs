use bytes::BytesMut;
use postgres_types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Sex group of a player as registered with the organization.
///
/// `Unknown` is a valid lookup key (its bias is pinned at zero) but is never
/// adjusted by the offset controller.
#[derive(
    Deserialize, Serialize, Display, EnumString, EnumIter, Debug, Clone, Copy, PartialEq, Eq, Hash, Default
)]
pub enum Sex {
    #[serde(rename = "M")]
    #[strum(serialize = "M")]
    Male,
    #[serde(rename = "F")]
    #[strum(serialize = "F")]
    Female,
    #[serde(rename = "X")]
    #[strum(serialize = "X")]
    NonBinary,
    #[default]
    #[serde(rename = "U")]
    #[strum(serialize = "U")]
    Unknown
}

impl Sex {
    /// Stable dense index, used by the counts/bias arrays.
    pub fn index(&self) -> usize {
        match self {
            Sex::Male => 0,
            Sex::Female => 1,
            Sex::NonBinary => 2,
            Sex::Unknown => 3
        }
    }

    /// The sexes whose bias rows are persisted and adjusted.
    pub const ADJUSTED: [Sex; 3] = [Sex::Male, Sex::Female, Sex::NonBinary];
}

impl ToSql for Sex {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        <String as ToSql>::to_sql(&self.to_string(), ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for Sex {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let s = <&str as FromSql>::from_sql(ty, raw)?;
        Ok(s.trim().parse::<Sex>()?)
    }

    fn accepts(ty: &Type) -> bool {
        <&str as FromSql>::accepts(ty)
    }
}

/// Per-sex tallies for one side of a match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SexCounts {
    counts: [u32; 4]
}

impl SexCounts {
    pub fn from_players<'a, I: IntoIterator<Item = &'a Sex>>(sexes: I) -> Self {
        let mut counts = SexCounts::default();
        for sex in sexes {
            counts.add(*sex);
        }
        counts
    }

    pub fn add(&mut self, sex: Sex) {
        self.counts[sex.index()] += 1;
    }

    pub fn get(&self, sex: Sex) -> u32 {
        self.counts[sex.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sex_codes() {
        assert_eq!(Sex::Male.to_string(), "M");
        assert_eq!("X".parse::<Sex>().unwrap(), Sex::NonBinary);
        assert_eq!("U".parse::<Sex>().unwrap(), Sex::Unknown);
    }

    #[test]
    fn test_counts() {
        let counts = SexCounts::from_players([Sex::Male, Sex::Female, Sex::Male].iter());
        assert_eq!(counts.get(Sex::Male), 2);
        assert_eq!(counts.get(Sex::Female), 1);
        assert_eq!(counts.get(Sex::NonBinary), 0);
    }
}
