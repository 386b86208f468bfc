use bytes::BytesMut;
use postgres_types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::convert::TryFrom;

/// Importance class of a match, supplied by the provider.
#[derive(Deserialize_repr, Serialize_repr, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MatchTier {
    Sanctioned = 0,
    League = 1,
    Social = 2,
    Exhibition = 3,
    DefaultTier = 4,
    #[default]
    Unspecified = 5
}

impl TryFrom<i16> for MatchTier {
    type Error = ();

    fn try_from(v: i16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MatchTier::Sanctioned),
            1 => Ok(MatchTier::League),
            2 => Ok(MatchTier::Social),
            3 => Ok(MatchTier::Exhibition),
            4 => Ok(MatchTier::DefaultTier),
            5 => Ok(MatchTier::Unspecified),
            _ => Err(())
        }
    }
}

impl ToSql for MatchTier {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        <i16 as ToSql>::to_sql(&(*self as i16), ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <i16 as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for MatchTier {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let v = <i16 as FromSql>::from_sql(ty, raw)?;
        MatchTier::try_from(v).map_err(|_| format!("invalid match tier {v}").into())
    }

    fn accepts(ty: &Type) -> bool {
        <i16 as FromSql>::accepts(ty)
    }
}
