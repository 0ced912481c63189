use crate::ipc::error::{err, ok};
use crate::ipc::types::{Actor, AppState, Request};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn with_notification(mut self, notification: serde_json::Value) -> HandlerErr {
        let mut details = match self.details.take() {
            Some(serde_json::Value::Object(m)) => m,
            _ => serde_json::Map::new(),
        };
        details.insert("notification".to_string(), notification);
        self.details = Some(serde_json::Value::Object(details));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespondentKind {
    Student,
    Prospect,
}

impl RespondentKind {
    fn parse(raw: &str) -> Option<RespondentKind> {
        match raw {
            "student" => Some(RespondentKind::Student),
            "prospect" => Some(RespondentKind::Prospect),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RespondentKind::Student => "student",
            RespondentKind::Prospect => "prospect",
        }
    }
}

/// One selected table row, as submitted. The type string is kept raw here;
/// it is checked per record inside the batch transaction so that an invalid
/// entry rolls back everything created before it.
struct RecordRef {
    kind: String,
    id: String,
}

struct BulkCreateInput {
    records: Vec<RecordRef>,
    division_id: String,
    status_id: String,
    priority_id: String,
    assigned_to_id: Option<String>,
    close_details: Option<String>,
    res_details: Option<String>,
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn lookup_exists(conn: &Connection, sql: &'static str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })
}

fn select_options(conn: &Connection, sql: &'static str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    stmt.query_map([], |r| {
        let id: String = r.get(0)?;
        let name: String = r.get(1)?;
        Ok(json!({ "id": id, "name": name }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Division preselected in the form: the actor's team's division wins,
/// otherwise the workspace default division, otherwise none.
fn default_division_id(conn: &Connection, actor_id: &str) -> Result<Option<String>, HandlerErr> {
    let team_division: Option<String> = conn
        .query_row(
            "SELECT t.division_id
             FROM users u
             JOIN teams t ON t.id = u.team_id
             WHERE u.id = ?",
            [actor_id],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .flatten();
    if team_division.is_some() {
        return Ok(team_division);
    }
    conn.query_row("SELECT id FROM divisions WHERE is_default = 1", [], |r| {
        r.get(0)
    })
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn bulk_create_form(conn: &Connection, actor: &Actor) -> Result<serde_json::Value, HandlerErr> {
    let divisions = select_options(conn, "SELECT id, name FROM divisions ORDER BY name")?;
    let statuses = select_options(conn, "SELECT id, name FROM case_statuses ORDER BY name")?;
    let priorities = select_options(
        conn,
        "SELECT id, name FROM case_priorities ORDER BY sort_order",
    )?;
    let users = select_options(conn, "SELECT id, name FROM users ORDER BY name")?;

    let division_default = default_division_id(conn, &actor.id)?;
    // The division picker only shows once the workspace has divisions beyond
    // the default one; hidden, its default still submits.
    let division_visible = conn
        .query_row(
            "SELECT 1 FROM divisions WHERE is_default = 0 LIMIT 1",
            [],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();

    Ok(json!({
        "action": "cases.bulkCreate",
        "label": "Open Case",
        "icon": "folder-open",
        "modalHeading": "Create Case",
        "deselectOnCompletion": true,
        "fields": [
            {
                "key": "divisionId",
                "type": "select",
                "label": "Division",
                "required": true,
                "options": divisions,
                "default": division_default,
                "visible": division_visible,
                "submitWhenHidden": true
            },
            {
                "key": "statusId",
                "type": "select",
                "label": "Status",
                "required": true,
                "preload": true,
                "options": statuses
            },
            {
                "key": "priorityId",
                "type": "select",
                "label": "Priority",
                "required": true,
                "options": priorities
            },
            {
                "key": "assignedToId",
                "type": "select",
                "label": "Assign Case to",
                "required": false,
                "searchable": true,
                "options": users
            },
            {
                "key": "closeDetails",
                "type": "textarea",
                "label": "Close Details/Description",
                "required": false
            },
            {
                "key": "resDetails",
                "type": "textarea",
                "label": "Internal Case Details",
                "required": false
            }
        ]
    }))
}

fn parse_bulk_create(params: &serde_json::Value) -> Result<BulkCreateInput, HandlerErr> {
    let Some(records_json) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing records".to_string(),
            details: None,
        });
    };
    if records_json.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "records must not be empty".to_string(),
            details: None,
        });
    }
    let mut records = Vec::with_capacity(records_json.len());
    for entry in records_json {
        let Some(kind) = entry.get("type").and_then(|v| v.as_str()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "each record needs a type".to_string(),
                details: None,
            });
        };
        let Some(id) = entry.get("id").and_then(|v| v.as_str()) else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "each record needs an id".to_string(),
                details: None,
            });
        };
        records.push(RecordRef {
            kind: kind.to_string(),
            id: id.to_string(),
        });
    }

    let division_id = get_required_str(params, "divisionId")?;
    let status_id = get_required_str(params, "statusId")?;
    let priority_id = get_required_str(params, "priorityId")?;
    let assigned_to_id = params
        .get("assignedToId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let close_details = params
        .get("closeDetails")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });
    let res_details = params
        .get("resDetails")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });

    Ok(BulkCreateInput {
        records,
        division_id,
        status_id,
        priority_id,
        assigned_to_id,
        close_details,
        res_details,
    })
}

fn validate_bulk_create_refs(conn: &Connection, input: &BulkCreateInput) -> Result<(), HandlerErr> {
    if !lookup_exists(conn, "SELECT 1 FROM divisions WHERE id = ?", &input.division_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "division not found".to_string(),
            details: None,
        });
    }
    if !lookup_exists(
        conn,
        "SELECT 1 FROM case_statuses WHERE id = ?",
        &input.status_id,
    )? {
        return Err(HandlerErr {
            code: "not_found",
            message: "status not found".to_string(),
            details: None,
        });
    }
    if !lookup_exists(
        conn,
        "SELECT 1 FROM case_priorities WHERE id = ?",
        &input.priority_id,
    )? {
        return Err(HandlerErr {
            code: "not_found",
            message: "priority not found".to_string(),
            details: None,
        });
    }
    if let Some(user_id) = input.assigned_to_id.as_deref() {
        if !lookup_exists(conn, "SELECT 1 FROM users WHERE id = ?", user_id)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "assignee not found".to_string(),
                details: None,
            });
        }
    }
    Ok(())
}

/// The batch itself: one transaction, one case per record, optionally one
/// assignment per case. Any error returns early, dropping the transaction,
/// which rolls back every row written so far.
fn bulk_create_cases(
    conn: &Connection,
    actor_id: &str,
    input: &BulkCreateInput,
) -> Result<Vec<String>, HandlerErr> {
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let now = Utc::now().to_rfc3339();
    let mut case_ids = Vec::with_capacity(input.records.len());

    for record in &input.records {
        let Some(kind) = RespondentKind::parse(&record.kind) else {
            return Err(HandlerErr {
                code: "invalid_record_type",
                message: "record must be of type student or prospect".to_string(),
                details: Some(json!({ "type": record.kind, "id": record.id })),
            });
        };
        let exists_sql = match kind {
            RespondentKind::Student => "SELECT 1 FROM students WHERE id = ?",
            RespondentKind::Prospect => "SELECT 1 FROM prospects WHERE id = ?",
        };
        if !lookup_exists(&tx, exists_sql, &record.id)? {
            return Err(HandlerErr {
                code: "not_found",
                message: format!("{} not found", kind.as_str()),
                details: Some(json!({ "type": kind.as_str(), "id": record.id })),
            });
        }

        let case_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO cases(id, respondent_type, respondent_id, division_id, status_id,
                               priority_id, close_details, res_details, created_by_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &case_id,
                kind.as_str(),
                &record.id,
                &input.division_id,
                &input.status_id,
                &input.priority_id,
                &input.close_details,
                &input.res_details,
                actor_id,
                &now,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "cases" })),
        })?;

        if let Some(user_id) = input.assigned_to_id.as_deref() {
            let assignment_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO case_assignments(id, case_id, user_id, assigned_by_id, assigned_at, status)
                 VALUES(?, ?, ?, ?, ?, 'active')",
                (&assignment_id, &case_id, user_id, actor_id, &now),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "case_assignments" })),
            })?;
        }

        case_ids.push(case_id);
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(case_ids)
}

fn success_notification(record_count: usize) -> serde_json::Value {
    let (title, body) = if record_count == 1 {
        ("Case created", "The case have been created with your selections.")
    } else {
        ("Cases created", "The cases have been created with your selections.")
    };
    json!({ "level": "success", "title": title, "body": body })
}

fn failure_notification(record_count: usize) -> serde_json::Value {
    let body = if record_count == 1 {
        "We failed to create the case. Please try again later."
    } else {
        "We failed to create the cases. Please try again later."
    };
    json!({ "level": "danger", "title": "Something went wrong", "body": body })
}

struct CaseRow {
    id: String,
    respondent_type: String,
    respondent_id: String,
    respondent_name: Option<String>,
    division: String,
    status: String,
    priority: String,
    close_details: Option<String>,
    res_details: Option<String>,
    created_by: String,
    created_at: String,
}

fn cases_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let respondent_type = params
        .get("respondentType")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let respondent_id = params
        .get("respondentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let filter = match (respondent_type, respondent_id) {
        (Some(t), Some(id)) => {
            let Some(kind) = RespondentKind::parse(&t) else {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "respondentType must be student or prospect".to_string(),
                    details: None,
                });
            };
            Some((kind, id))
        }
        (None, None) => None,
        _ => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "respondentType and respondentId go together".to_string(),
                details: None,
            })
        }
    };

    let mut sql = String::from(
        "SELECT
           c.id,
           c.respondent_type,
           c.respondent_id,
           CASE c.respondent_type
             WHEN 'student' THEN
               (SELECT s.last_name || ', ' || s.first_name FROM students s WHERE s.id = c.respondent_id)
             ELSE
               (SELECT p.last_name || ', ' || p.first_name FROM prospects p WHERE p.id = c.respondent_id)
           END,
           d.name,
           st.name,
           pr.name,
           c.close_details,
           c.res_details,
           u.name,
           c.created_at
         FROM cases c
         JOIN divisions d ON d.id = c.division_id
         JOIN case_statuses st ON st.id = c.status_id
         JOIN case_priorities pr ON pr.id = c.priority_id
         JOIN users u ON u.id = c.created_by_id",
    );
    let mut args: Vec<Value> = Vec::new();
    if let Some((kind, id)) = &filter {
        sql.push_str(" WHERE c.respondent_type = ? AND c.respondent_id = ?");
        args.push(Value::Text(kind.as_str().to_string()));
        args.push(Value::Text(id.clone()));
    }
    sql.push_str(" ORDER BY c.created_at DESC, c.id");

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(CaseRow {
                id: r.get(0)?,
                respondent_type: r.get(1)?,
                respondent_id: r.get(2)?,
                respondent_name: r.get(3)?,
                division: r.get(4)?,
                status: r.get(5)?,
                priority: r.get(6)?,
                close_details: r.get(7)?,
                res_details: r.get(8)?,
                created_by: r.get(9)?,
                created_at: r.get(10)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    // Latest assignment per case: scan in assignment order, later rows win.
    let mut assignments: HashMap<String, serde_json::Value> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT ca.case_id, ca.user_id, u.name, ca.assigned_by_id, ca.assigned_at, ca.status
             FROM case_assignments ca
             JOIN users u ON u.id = ca.user_id
             ORDER BY ca.assigned_at",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let assignment_rows = stmt
        .query_map([], |r| {
            let case_id: String = r.get(0)?;
            let user_id: String = r.get(1)?;
            let name: String = r.get(2)?;
            let assigned_by_id: String = r.get(3)?;
            let assigned_at: String = r.get(4)?;
            let status: String = r.get(5)?;
            Ok((
                case_id,
                json!({
                    "userId": user_id,
                    "name": name,
                    "assignedById": assigned_by_id,
                    "assignedAt": assigned_at,
                    "status": status
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    for (case_id, assignment) in assignment_rows {
        assignments.insert(case_id, assignment);
    }

    let cases_json: Vec<serde_json::Value> = rows
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "respondentType": c.respondent_type,
                "respondentId": c.respondent_id,
                "respondentName": c.respondent_name,
                "division": c.division,
                "status": c.status,
                "priority": c.priority,
                "closeDetails": c.close_details,
                "resDetails": c.res_details,
                "createdBy": c.created_by,
                "createdAt": c.created_at,
                "assignedTo": assignments.get(&c.id).cloned().unwrap_or(serde_json::Value::Null)
            })
        })
        .collect();

    Ok(json!({ "cases": cases_json }))
}

fn handle_cases_bulk_create_form(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(actor) = state.actor.as_ref() else {
        return err(&req.id, "no_session", "sign in first", None);
    };
    match bulk_create_form(conn, actor) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_cases_bulk_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(actor) = state.actor.as_ref() else {
        return err(&req.id, "no_session", "sign in first", None);
    };

    // Validation failures return plain errors; the notification pair belongs
    // to the batch itself, which has not started yet.
    let input = match parse_bulk_create(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = validate_bulk_create_refs(conn, &input) {
        return e.response(&req.id);
    }

    match bulk_create_cases(conn, &actor.id, &input) {
        Ok(case_ids) => ok(
            &req.id,
            json!({
                "created": case_ids.len(),
                "caseIds": case_ids,
                "notification": success_notification(input.records.len())
            }),
        ),
        Err(e) => {
            tracing::error!(code = e.code, message = %e.message, "bulk case create failed");
            e.with_notification(failure_notification(input.records.len()))
                .response(&req.id)
        }
    }
}

fn handle_cases_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match cases_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cases.bulkCreateForm" => Some(handle_cases_bulk_create_form(state, req)),
        "cases.bulkCreate" => Some(handle_cases_bulk_create(state, req)),
        "cases.list" => Some(handle_cases_list(state, req)),
        _ => None,
    }
}
