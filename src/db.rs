use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("reply_db")]
pub struct ReplyDb(sqlx::PgPool);
