//! Books repository for database operations

use sqlx::{PgConnection, Pool, Postgres, QueryBuilder};

use crate::{
    error::{AppError, AppResult},
    models::book::{Book, BookQuery, NewBook},
};

const BOOK_COLUMNS: &str = "id, title, author, isbn, total_copies, available_copies";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct BooksRepository {
    pool: Pool<Postgres>,
}

impl BooksRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get book by ID, without locking
    pub async fn get_by_id(&self, id: i32) -> AppResult<Option<Book>> {
        let book = sqlx::query_as::<_, Book>(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(book)
    }

    /// Search books by partial title/author with pagination
    pub async fn search(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {BOOK_COLUMNS} FROM books WHERE 1=1"));

        if let Some(ref title) = query.title {
            builder.push(" AND title ILIKE ").push_bind(format!("%{}%", title));
        }
        if let Some(ref author) = query.author {
            builder.push(" AND author ILIKE ").push_bind(format!("%{}%", author));
        }

        builder
            .push(" ORDER BY id LIMIT ")
            .push_bind(query.limit())
            .push(" OFFSET ")
            .push_bind(query.skip());

        let books = builder.build_query_as::<Book>().fetch_all(&self.pool).await?;
        Ok(books)
    }
}

/// Load a book with `FOR UPDATE`, serializing concurrent stock changes on it
pub(crate) async fn lock_by_id(conn: &mut PgConnection, id: i32) -> AppResult<Option<Book>> {
    let book = sqlx::query_as::<_, Book>(&format!(
        "SELECT {BOOK_COLUMNS} FROM books WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(book)
}

pub(crate) async fn set_available_copies(conn: &mut PgConnection, id: i32, available: i32) -> AppResult<()> {
    let rows = sqlx::query("UPDATE books SET available_copies = $2 WHERE id = $1")
        .bind(id)
        .bind(available)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if rows == 0 {
        return Err(AppError::BookNotFound(id));
    }
    Ok(())
}

pub(crate) async fn insert(conn: &mut PgConnection, book: &NewBook) -> AppResult<Book> {
    let result = sqlx::query_as::<_, Book>(&format!(
        r#"
        INSERT INTO books (title, author, isbn, total_copies, available_copies)
        VALUES ($1, $2, $3, $4, $4)
        RETURNING {BOOK_COLUMNS}
        "#
    ))
    .bind(&book.title)
    .bind(&book.author)
    .bind(&book.isbn)
    .bind(book.total_copies)
    .fetch_one(&mut *conn)
    .await;

    match result {
        Ok(book) => Ok(book),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            Err(AppError::DuplicateIsbn(book.isbn.clone()))
        }
        Err(e) => Err(e.into()),
    }
}
