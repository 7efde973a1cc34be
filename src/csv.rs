use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{Show, ShowCategory, ShowDate, ShowDateDetail, ShowDateId, ShowId, UserBalance};
use crate::{Command, Points, UserId};

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{command}'")]
    UnrecognizedType { line: usize, command: String },

    #[error("line {line}: {command} missing id")]
    MissingId { line: usize, command: String },

    #[error("line {line}: show date {show_date} has {reserved} reserved seats for a capacity of {capacity}")]
    OverCapacity {
        line: usize,
        show_date: ShowDateId,
        reserved: u32,
        capacity: u32,
    },

    #[error("failed to write row: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush output: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct CommandRow {
    r#type: String,
    user: UserId,
    id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ShowDateRow {
    show_date: ShowDateId,
    show: ShowId,
    title: String,
    category: ShowCategory,
    location: String,
    price: Points,
    date: DateTime<Utc>,
    capacity: u32,
    reserved: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UserRow {
    user: UserId,
    points: Option<Points>,
}

#[derive(Debug, Serialize)]
struct BalanceRow {
    user: UserId,
    points: Points,
    active: usize,
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Deserialize every row, tagging errors with their 1-indexed line (header is line 1).
fn rows<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<impl Iterator<Item = (usize, Result<T, CsvError>)> + use<T>, CsvError> {
    Ok(reader(path)?
        .into_deserialize::<T>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2;
            (line, result.map_err(|source| CsvError::Parse { line, source }))
        }))
}

/// Read reservation commands from a csv file with columns `type,user,id`
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    Ok(rows::<CommandRow>(path.as_ref())?.map(|(line, result)| {
        let row = result?;
        let id = |command: &str| {
            row.id.ok_or_else(|| CsvError::MissingId {
                line,
                command: command.to_string(),
            })
        };
        match row.r#type.as_str() {
            "create" => Ok(Command::Create {
                user: row.user,
                show_date: id("create")?,
            }),
            "cancel" => Ok(Command::Cancel {
                user: row.user,
                reservation: id("cancel")?,
            }),
            "list" => Ok(Command::List { user: row.user }),
            other => Err(CsvError::UnrecognizedType {
                line,
                command: other.to_string(),
            }),
        }
    }))
}

/// Read show dates, each joined with its show, from a csv file
pub fn read_show_dates(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<ShowDateDetail, CsvError>>, CsvError> {
    Ok(rows::<ShowDateRow>(path.as_ref())?.map(|(line, result)| {
        let row = result?;
        let reserved = row.reserved.unwrap_or(0);
        if reserved > row.capacity {
            return Err(CsvError::OverCapacity {
                line,
                show_date: row.show_date,
                reserved,
                capacity: row.capacity,
            });
        }
        Ok(ShowDateDetail {
            show: Show {
                id: row.show,
                title: row.title,
                category: row.category,
                location: row.location,
                price: row.price,
            },
            show_date: ShowDate {
                id: row.show_date,
                show_id: row.show,
                date: row.date,
                capacity: row.capacity,
                reserved,
            },
        })
    }))
}

/// Read user balances from a csv file. A missing balance means a new user with the default points.
pub fn read_users(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<UserBalance, CsvError>>, CsvError> {
    Ok(rows::<UserRow>(path.as_ref())?.map(|(_, result)| {
        let row = result?;
        Ok(UserBalance::new(
            row.user,
            row.points.unwrap_or(UserBalance::DEFAULT_POINTS),
        ))
    }))
}

/// Write user balances as csv with columns `user,points,active`
pub fn write_balances(
    writer: impl io::Write,
    balances: impl IntoIterator<Item = (UserId, Points, usize)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (user, points, active) in balances {
        writer.serialize(BalanceRow {
            user,
            points,
            active,
        })?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn read_create_cancel_and_list() {
        let file = write_csv("type,user,id\ncreate,1,10\ncancel,2,3\nlist,1,\n");
        let commands: Vec<_> = read_commands(file.path())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            commands,
            vec![
                Command::Create {
                    user: 1,
                    show_date: 10
                },
                Command::Cancel {
                    user: 2,
                    reservation: 3
                },
                Command::List { user: 1 },
            ]
        );
    }

    #[test]
    fn read_with_whitespace() {
        let file = write_csv("type, user, id\ncreate, 1, 10\n");
        let results: Vec<_> = read_commands(file.path()).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn read_returns_error_for_unknown_type() {
        let file = write_csv("type,user,id\nrefund,1,1\n");
        let results: Vec<_> = read_commands(file.path()).unwrap().collect();
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedType { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_id() {
        let file = write_csv("type,user,id\ncreate,1,10\ncancel,1,\n");
        let results: Vec<_> = read_commands(file.path()).unwrap().collect();
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::MissingId { line: 3, .. }));
    }

    #[test]
    fn read_returns_error_for_bad_user() {
        let file = write_csv("type,user,id\ncreate,-1,10\n");
        let results: Vec<_> = read_commands(file.path()).unwrap().collect();
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::Parse { line: 2, .. }
        ));
    }

    #[test]
    fn open_missing_file_fails() {
        let result = read_commands("/definitely/not/here.csv");
        assert!(matches!(result, Err(CsvError::Open { .. })));
    }

    #[test]
    fn read_show_date_rows() {
        let file = write_csv(
            "show_date,show,title,category,location,price,date,capacity,reserved\n\
             10,1,Cats,musical,Seoul,45000,2099-01-01T19:00:00Z,100,\n\
             11,1,Cats,musical,Seoul,45000,2099-01-02T19:00:00Z,100,7\n",
        );
        let details: Vec<_> = read_show_dates(file.path())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].show.category, ShowCategory::Musical);
        assert_eq!(details[0].show.price, Points::new(45_000));
        assert_eq!(details[0].show_date.reserved, 0);
        assert_eq!(details[1].show_date.reserved, 7);
        assert_eq!(details[1].show_date.date.to_rfc3339(), "2099-01-02T19:00:00+00:00");
    }

    #[test]
    fn read_show_date_rejects_over_capacity() {
        let file = write_csv(
            "show_date,show,title,category,location,price,date,capacity,reserved\n\
             10,1,Cats,musical,Seoul,45000,2099-01-01T19:00:00Z,1,2\n",
        );
        let results: Vec<_> = read_show_dates(file.path()).unwrap().collect();
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::OverCapacity { line: 2, show_date: 10, .. }
        ));
    }

    #[test]
    fn read_show_date_rejects_unknown_category() {
        let file = write_csv(
            "show_date,show,title,category,location,price,date,capacity,reserved\n\
             10,1,Cats,opera,Seoul,45000,2099-01-01T19:00:00Z,1,0\n",
        );
        let results: Vec<_> = read_show_dates(file.path()).unwrap().collect();
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::Parse { line: 2, .. }
        ));
    }

    #[test]
    fn read_users_defaults_missing_points() {
        let file = write_csv("user,points\n1,100\n2,\n");
        let users: Vec<_> = read_users(file.path())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(users[0], UserBalance::new(1, Points::new(100)));
        assert_eq!(users[1], UserBalance::new(2, UserBalance::DEFAULT_POINTS));
    }

    #[test]
    fn write_balances_rows() {
        let mut out = Vec::new();
        write_balances(
            &mut out,
            [(1, Points::new(0), 1), (2, Points::new(100), 0)],
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "user,points,active\n1,0,1\n2,100,0\n"
        );
    }
}
