use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

use super::strategy::EventRow;

/// SQL Insert Events Builder
///
/// A builder for constructing the multi-row insert into a stream table. The
/// whole batch is one prepared statement, so it is atomic on its own and
/// participates in whatever transaction executes it.
pub(crate) struct InsertEventsBuilder<'a> {
    builder: sqlx::QueryBuilder<'a, Postgres>,
    columns: &'static [&'static str],
    rows: Vec<EventRow>,
}

impl<'a> InsertEventsBuilder<'a> {
    /// Creates a new instance of `InsertEventsBuilder`.
    ///
    /// # Arguments
    ///
    /// * `table` - The physical stream table.
    /// * `columns` - The strategy's column list, in binding order.
    /// * `rows` - The flattened events to be inserted.
    pub fn new(table: &str, columns: &'static [&'static str], rows: Vec<EventRow>) -> Self {
        Self {
            builder: sqlx::QueryBuilder::new(format!("INSERT INTO {table} (")),
            columns,
            rows,
        }
    }

    /// Builds the SQL batch insert query.
    pub fn build(&'a mut self) -> Query<'a, Postgres, PgArguments> {
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
