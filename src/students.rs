use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Student {
    pub id: i32,
    pub nim: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub program_id: i32,
    pub status: String,
    pub registration_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StudyProgram {
    pub id: i32,
    pub name: String,
    pub code: String,
    pub tuition_amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Explicit accessor used wherever a caller needs the student record rather
/// than reaching through relationships.
pub async fn fetch_student(pool: &PgPool, student_id: i32) -> AppResult<Student> {
    sqlx::query_as::<_, Student>("SELECT * FROM students WHERE id = $1")
        .bind(student_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("student"))
}

pub async fn fetch_program(pool: &PgPool, program_id: i32) -> AppResult<StudyProgram> {
    sqlx::query_as::<_, StudyProgram>("SELECT * FROM study_programs WHERE id = $1")
        .bind(program_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("study program"))
}

#[derive(Debug, Deserialize)]
pub struct NewStudent {
    pub nim: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub program_id: i32,
}

pub async fn create_student(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<NewStudent>,
) -> AppResult<impl IntoResponse> {
    let mut errors = Vec::new();
    if payload.nim.trim().is_empty() {
        errors.push("nim must not be empty".to_string());
    }
    if payload.name.trim().is_empty() {
        errors.push("name must not be empty".to_string());
    }
    if payload.email.trim().is_empty() || !payload.email.contains('@') {
        errors.push("email must be a valid address".to_string());
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    // resolve the program explicitly; a dangling id is a caller error
    fetch_program(&pool, payload.program_id).await?;

    let student = sqlx::query_as::<_, Student>(
        "INSERT INTO students (nim, name, email, phone, program_id) \
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(payload.nim.trim())
    .bind(payload.name.trim())
    .bind(payload.email.trim())
    .bind(&payload.phone)
    .bind(payload.program_id)
    .fetch_one(&pool)
    .await
    .map_err(|e| AppError::conflict_on_unique(e, "nim or email already registered"))?;

    Ok((StatusCode::CREATED, Json(student)))
}

#[derive(Debug, Deserialize)]
pub struct StudentFilter {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list_students(
    Extension(pool): Extension<PgPool>,
    Query(filter): Query<StudentFilter>,
) -> AppResult<Json<Vec<Student>>> {
    let students = match filter.status {
        Some(status) => {
            sqlx::query_as::<_, Student>(
                "SELECT * FROM students WHERE status = $1 ORDER BY nim",
            )
            .bind(status)
            .fetch_all(&pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Student>("SELECT * FROM students ORDER BY nim")
                .fetch_all(&pool)
                .await?
        }
    };
    Ok(Json(students))
}

#[derive(Debug, Serialize)]
pub struct StudentDetail {
    #[serde(flatten)]
    pub student: Student,
    pub program: StudyProgram,
}

pub async fn get_student(
    Extension(pool): Extension<PgPool>,
    Path(student_id): Path<i32>,
) -> AppResult<Json<StudentDetail>> {
    let student = fetch_student(&pool, student_id).await?;
    let program = fetch_program(&pool, student.program_id).await?;
    Ok(Json(StudentDetail { student, program }))
}

pub async fn list_programs(
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Vec<StudyProgram>>> {
    let programs =
        sqlx::query_as::<_, StudyProgram>("SELECT * FROM study_programs ORDER BY name")
            .fetch_all(&pool)
            .await?;
    Ok(Json(programs))
}
