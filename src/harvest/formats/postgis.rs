//! PostGIS table writer.
//!
//! Each `write` opens its own connection, enables the `postgis` extension,
//! prepares both tables according to the [`ConflictPolicy`], bulk-inserts
//! rows in chunks, then drops and recreates a GIST index on each table's
//! `geometry` column. The connection is closed before returning.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use tracing::{info, instrument};

use super::{
    line_segments, located_places, place_values, segment_values, wkb, AttrValue, Field, FieldKind,
    PLACE_FIELDS, SEGMENT_FIELDS,
};
use crate::config::{ConflictPolicy, DatabaseConfig, TableNames, WGS84_SRID};
use crate::harvest::traits::SinkError;
use crate::model::{Place, RoadSegment};
use crate::traits::{FeatureSink, SinkReport};

/// Rows per INSERT statement; keeps bind counts far below Postgres' limit.
pub const DEFAULT_INSERT_CHUNK_SIZE: usize = 1000;

/// One feature ready for insertion: WKB geometry plus attribute values.
struct Row<'a> {
    geometry: Vec<u8>,
    values: Vec<AttrValue<'a>>,
}

pub struct PostGisSink {
    db: DatabaseConfig,
    tables: TableNames,
    chunk_size: usize,
}

impl PostGisSink {
    pub fn new(db: DatabaseConfig, tables: TableNames) -> Self {
        Self {
            db,
            tables,
            chunk_size: DEFAULT_INSERT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn qualified(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.db.schema, table)
    }

    /// Current row counts of the segments and places tables.
    pub async fn table_counts(&self) -> Result<(i64, i64), SinkError> {
        let mut conn = PgConnection::connect(&self.db.url).await?;
        let segments = count_rows(&mut conn, &self.qualified(&self.tables.segments)).await?;
        let places = count_rows(&mut conn, &self.qualified(&self.tables.places)).await?;
        conn.close().await?;
        Ok((segments, places))
    }

    async fn load_table(
        &self,
        conn: &mut PgConnection,
        table: &str,
        geometry_type: &str,
        fields: &[Field],
        rows: &[Row<'_>],
    ) -> Result<usize, SinkError> {
        let qualified = self.qualified(table);
        let mut tx = conn.begin().await?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(&self.db.schema)
        .bind(table)
        .fetch_one(&mut *tx)
        .await?;

        let ddl = create_table_sql(&qualified, geometry_type, fields);
        match self.db.if_exists {
            ConflictPolicy::Fail if exists => {
                return Err(SinkError::TableExists {
                    schema: self.db.schema.clone(),
                    table: table.to_string(),
                });
            }
            ConflictPolicy::Replace => {
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", qualified))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(&ddl).execute(&mut *tx).await?;
            }
            ConflictPolicy::Append | ConflictPolicy::Fail => {
                sqlx::query(&ddl.replacen("CREATE TABLE", "CREATE TABLE IF NOT EXISTS", 1))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let columns: Vec<String> = fields.iter().map(|f| format!("\"{}\"", f.name)).collect();
        for chunk in rows.chunks(self.chunk_size) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}, geometry) ",
                qualified,
                columns.join(", ")
            ));
            builder.push_values(chunk, |mut b, row| {
                for value in &row.values {
                    match value {
                        AttrValue::Integer(v) => b.push_bind(*v),
                        AttrValue::Real(v) => b.push_bind(*v),
                        AttrValue::Text(v) => b.push_bind(v.map(str::to_string)),
                    };
                }
                b.push("ST_SetSRID(ST_GeomFromWKB(")
                    .push_bind_unseparated(row.geometry.clone())
                    .push_unseparated(format!("), {})", WGS84_SRID));
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        info!(rows = rows.len(), table = %qualified, "Loaded rows");
        Ok(rows.len())
    }

    async fn rebuild_index(&self, conn: &mut PgConnection, table: &str) -> Result<(), SinkError> {
        let index = format!("idx_{}_geom", table);
        sqlx::query(&format!("DROP INDEX IF EXISTS \"{}\".\"{}\"", self.db.schema, index))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!(
            "CREATE INDEX \"{}\" ON {} USING GIST (geometry)",
            index,
            self.qualified(table)
        ))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FeatureSink for PostGisSink {
    fn name(&self) -> &str {
        "postgis"
    }

    #[instrument(skip_all, fields(schema = %self.db.schema))]
    async fn write(
        &self,
        segments: &[RoadSegment],
        places: &[Place],
    ) -> Result<SinkReport, SinkError> {
        self.db.validate()?;
        self.tables.validate()?;

        let line_rows: Vec<Row<'_>> = line_segments(segments)
            .into_iter()
            .map(|s| Row {
                geometry: wkb::linestring(&s.coordinates),
                values: segment_values(s).to_vec(),
            })
            .collect();
        let point_rows: Vec<Row<'_>> = located_places(places)
            .into_iter()
            .filter_map(|p| {
                Some(Row {
                    geometry: wkb::point(p.location?),
                    values: place_values(p).to_vec(),
                })
            })
            .collect();

        let mut conn = PgConnection::connect(&self.db.url).await?;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
            .execute(&mut conn)
            .await?;
        info!("PostGIS extension confirmed");

        let segments_written = self
            .load_table(&mut conn, &self.tables.segments, "LineString", &SEGMENT_FIELDS, &line_rows)
            .await?;
        let places_written = self
            .load_table(&mut conn, &self.tables.places, "Point", &PLACE_FIELDS, &point_rows)
            .await?;

        self.rebuild_index(&mut conn, &self.tables.segments).await?;
        self.rebuild_index(&mut conn, &self.tables.places).await?;
        info!("Spatial indexes created");

        conn.close().await?;

        info!("Verify with these psql queries:");
        info!(
            "  SELECT count(*), road_type, segment_certainty FROM {} GROUP BY road_type, segment_certainty;",
            self.tables.segments
        );
        info!(
            "  SELECT count(*), place_type FROM {} GROUP BY place_type;",
            self.tables.places
        );
        info!(
            "  SELECT name, ST_Length(geometry::geography) AS length_m FROM {} ORDER BY length_m DESC LIMIT 10;",
            self.tables.segments
        );

        Ok(SinkReport {
            sink: self.name().to_string(),
            segments_written,
            places_written,
            targets: vec![
                format!("{}.{}", self.db.schema, self.tables.segments),
                format!("{}.{}", self.db.schema, self.tables.places),
            ],
        })
    }
}

async fn count_rows(conn: &mut PgConnection, qualified: &str) -> Result<i64, SinkError> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", qualified))
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

fn create_table_sql(qualified: &str, geometry_type: &str, fields: &[Field]) -> String {
    let mut columns: Vec<String> = fields
        .iter()
        .map(|f| {
            let sql_type = match f.kind {
                FieldKind::Integer => "BIGINT",
                FieldKind::Real => "DOUBLE PRECISION",
                FieldKind::Text => "TEXT",
            };
            format!("\"{}\" {}", f.name, sql_type)
        })
        .collect();
    columns.push(format!("geometry geometry({}, {})", geometry_type, WGS84_SRID));
    format!("CREATE TABLE {} ({})", qualified, columns.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql("\"public\".\"roman_road_places\"", "Point", &PLACE_FIELDS);
        assert_eq!(
            sql,
            "CREATE TABLE \"public\".\"roman_road_places\" (\"pleiades_id\" BIGINT, \"name\" TEXT, \
             \"place_type\" TEXT, \"start_year\" BIGINT, \"end_year\" BIGINT, \"url\" TEXT, \
             geometry geometry(Point, 4326))"
        );
    }

    #[test]
    fn test_qualified_names() {
        let sink = PostGisSink::new(
            DatabaseConfig::new("postgresql://localhost/roman_roads").with_schema("gis"),
            TableNames::default(),
        );
        assert_eq!(sink.qualified("roman_road_segments"), "\"gis\".\"roman_road_segments\"");
    }

    #[tokio::test]
    async fn test_invalid_schema_is_rejected_before_connecting() {
        let sink = PostGisSink::new(
            DatabaseConfig::new("postgresql://nowhere.invalid/db").with_schema("bad;schema"),
            TableNames::default(),
        );
        let err = sink.write(&[], &[]).await.unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }
}
