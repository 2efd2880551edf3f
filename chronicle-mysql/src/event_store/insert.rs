use sqlx::mysql::MySqlArguments;
use sqlx::query::Query;
use sqlx::MySql;

use super::strategy::EventRow;

/// SQL Insert Events Builder
///
/// A builder for constructing the multi-row insert into a stream table. The
/// whole batch is one prepared statement, so it is atomic on its own and
/// participates in whatever transaction executes it.
pub(crate) struct InsertEventsBuilder<'a> {
    builder: sqlx::QueryBuilder<'a, MySql>,
    columns: &'static [&'static str],
    rows: Vec<EventRow>,
}

impl<'a> InsertEventsBuilder<'a> {
    pub fn new(table: &str, columns: &'static [&'static str], rows: Vec<EventRow>) -> Self {
        Self {
            builder: sqlx::QueryBuilder::new(format!("INSERT INTO {table} (")),
            columns,
            rows,
        }
    }

    /// Builds the SQL batch insert query.
    pub fn build(&'a mut self) -> Query<'a, MySql, MySqlArguments> {
        let mut separated_builder = self.builder.separated(",");
        for column in self.columns {
            separated_builder.push(*column);
        }
        separated_builder.push_unseparated(") ");

        let rows = std::mem::take(&mut self.rows);
        self.builder.push_values(rows, |mut b, row| {
            if let Some(no) = row.no {
                b.push_bind(no);
            }
            b.push_bind(row.event_id);
            b.push_bind(row.event_name);
            b.push_bind(row.payload);
            b.push_bind(row.metadata);
            b.push_bind(row.created_at);
        });
        self.builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::strategy::{
        AggregateStreamStrategy, PersistenceStrategy, SingleStreamStrategy,
    };
    use chronicle::EventEnvelope;
    use serde_json::json;
    use sqlx::Execute;

    fn events() -> Vec<EventEnvelope> {
        vec![
            EventEnvelope::new("UserCreated", json!({ "name": "Sasha" }))
                .with_metadata_entry("_aggregate_version", json!(1)),
            EventEnvelope::new("UsernameChanged", json!({ "name": "Alex" }))
                .with_metadata_entry("_aggregate_version", json!(2)),
        ]
    }

    #[test]
    fn it_builds_a_single_stream_insert() {
        let strategy = SingleStreamStrategy;
        let rows = strategy.prepare_data(&events()).unwrap();
        let mut insert_query = InsertEventsBuilder::new("_abc", strategy.column_names(), rows);
        assert_eq!(
            insert_query.build().sql(),
            "INSERT INTO _abc (event_id,event_name,payload,metadata,created_at) \
             VALUES (?, ?, ?, ?, ?), (?, ?, ?, ?, ?)"
        );
    }

    #[test]
    fn it_builds_an_aggregate_stream_insert() {
        let strategy = AggregateStreamStrategy;
        let rows = strategy.prepare_data(&events()).unwrap();
        let mut insert_query = InsertEventsBuilder::new("_abc", strategy.column_names(), rows);
        assert_eq!(
            insert_query.build().sql(),
            "INSERT INTO _abc (no,event_id,event_name,payload,metadata,created_at) \
             VALUES (?, ?, ?, ?, ?, ?), (?, ?, ?, ?, ?, ?)"
        );
    }
}
