use bytes::BytesMut;
use postgres_types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::convert::TryFrom;

/// Whether a match contributed to ratings.
#[derive(Deserialize_repr, Serialize_repr, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum RatingStatus {
    #[default]
    Rated = 0,
    Unrated = 1,
    Skipped = 2
}

impl TryFrom<i16> for RatingStatus {
    type Error = ();

    fn try_from(v: i16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(RatingStatus::Rated),
            1 => Ok(RatingStatus::Unrated),
            2 => Ok(RatingStatus::Skipped),
            _ => Err(())
        }
    }
}

impl ToSql for RatingStatus {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        <i16 as ToSql>::to_sql(&(*self as i16), ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <i16 as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for RatingStatus {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let v = <i16 as FromSql>::from_sql(ty, raw)?;
        RatingStatus::try_from(v).map_err(|_| format!("invalid rating status {v}").into())
    }

    fn accepts(ty: &Type) -> bool {
        <i16 as FromSql>::accepts(ty)
    }
}
