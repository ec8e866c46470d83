use crate::users::repo_types::User;
use sqlx::PgPool;

impl User {
    /// Insert a new user. A taken email surfaces as a unique violation.
    pub async fn create(db: &PgPool, email: &str, password: &str) -> sqlx::Result<User> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password)
            VALUES ($1, $2)
            RETURNING id, email, password, created_at
            "#,
        )
        .bind(email)
        .bind(password)
        .fetch_one(db)
        .await
    }
}
