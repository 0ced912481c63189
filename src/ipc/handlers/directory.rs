use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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
}

fn division_exists(conn: &Connection, division_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM divisions WHERE id = ?",
        [division_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn team_exists(conn: &Connection, team_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM teams WHERE id = ?", [team_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_divisions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let is_default = req
        .params
        .get("isDefault")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let division_id = Uuid::new_v4().to_string();

    if is_default {
        // At most one default division; flipping the flag and inserting must
        // land together.
        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        if let Err(e) = tx.execute("UPDATE divisions SET is_default = 0", []) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "divisions" })),
            );
        }
        if let Err(e) = tx.execute(
            "INSERT INTO divisions(id, name, is_default) VALUES(?, ?, 1)",
            (&division_id, &name),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "divisions" })),
            );
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_commit_failed", e.to_string(), None);
        }
    } else if let Err(e) = conn.execute(
        "INSERT INTO divisions(id, name, is_default) VALUES(?, ?, 0)",
        (&division_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "divisions" })),
        );
    }

    ok(
        &req.id,
        json!({ "divisionId": division_id, "name": name, "isDefault": is_default }),
    )
}

fn handle_divisions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare("SELECT id, name, is_default FROM divisions ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let is_default: i64 = row.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "isDefault": is_default != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(divisions) => ok(&req.id, json!({ "divisions": divisions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let division_id = req
        .params
        .get("divisionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(division_id) = division_id.as_deref() {
        match division_exists(conn, division_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "division not found", None),
            Err(e) => return e.response(&req.id),
        }
    }

    let team_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teams(id, name, division_id) VALUES(?, ?, ?)",
        (&team_id, &name, &division_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teams" })),
        );
    }

    ok(&req.id, json!({ "teamId": team_id }))
}

fn handle_teams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT t.id, t.name, t.division_id, d.name
         FROM teams t
         LEFT JOIN divisions d ON d.id = t.division_id
         ORDER BY t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let division_id: Option<String> = row.get(2)?;
            let division_name: Option<String> = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "divisionId": division_id,
                "divisionName": division_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teams) => ok(&req.id, json!({ "teams": teams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });
    let team_id = req
        .params
        .get("teamId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(team_id) = team_id.as_deref() {
        match team_exists(conn, team_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "team not found", None),
            Err(e) => return e.response(&req.id),
        }
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, email, team_id) VALUES(?, ?, ?, ?)",
        (&user_id, &name, &email, &team_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT u.id, u.name, u.email, u.team_id, t.name
         FROM users u
         LEFT JOIN teams t ON t.id = u.team_id
         ORDER BY u.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let email: Option<String> = row.get(2)?;
            let team_id: Option<String> = row.get(3)?;
            let team_name: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "teamId": team_id,
                "teamName": team_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_case_statuses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let status_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO case_statuses(id, name) VALUES(?, ?)",
        (&status_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "case_statuses" })),
        );
    }

    ok(&req.id, json!({ "statusId": status_id }))
}

fn handle_case_statuses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM case_statuses ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(statuses) => ok(&req.id, json!({ "statuses": statuses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_case_priorities_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let sort_order: i64 = match req.params.get("sortOrder").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => match conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM case_priorities",
            [],
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
    };

    let priority_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO case_priorities(id, name, sort_order) VALUES(?, ?, ?)",
        (&priority_id, &name, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "case_priorities" })),
        );
    }

    ok(
        &req.id,
        json!({ "priorityId": priority_id, "sortOrder": sort_order }),
    )
}

fn handle_case_priorities_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt =
        match conn.prepare("SELECT id, name, sort_order FROM case_priorities ORDER BY sort_order") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let sort_order: i64 = row.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(priorities) => ok(&req.id, json!({ "priorities": priorities })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "divisions.create" => Some(handle_divisions_create(state, req)),
        "divisions.list" => Some(handle_divisions_list(state, req)),
        "teams.create" => Some(handle_teams_create(state, req)),
        "teams.list" => Some(handle_teams_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "caseStatuses.create" => Some(handle_case_statuses_create(state, req)),
        "caseStatuses.list" => Some(handle_case_statuses_list(state, req)),
        "casePriorities.create" => Some(handle_case_priorities_create(state, req)),
        "casePriorities.list" => Some(handle_case_priorities_list(state, req)),
        _ => None,
    }
}
