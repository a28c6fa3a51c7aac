//! MySQL/MariaDB backend over `mysql_async`.
//!
//! One [`MysqlClient`] wraps one driver connection; the monitor owns one
//! persistent client per server plus short-lived probe connections. Dialect
//! differences (channel syntax, STOP ALL SLAVES, default_master_connection)
//! are resolved from the server version captured at connect time.

use super::{
    ChangeMasterOpt, Connector, DatabaseClient, DbError, EventEntry, Grant, MasterStatus,
    MasterUseGtid, Plugin, ProcessEntry, ServerVersion, SlaveStatus, UsingGtid,
};
use crate::config::Credentials;
use crate::gtid::GtidList;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Map a driver error onto the [`DbError`] taxonomy.
fn map_err(err: mysql_async::Error) -> DbError {
    match err {
        mysql_async::Error::Server(server_err) => {
            let message = server_err.message.clone();
            match server_err.code {
                1045 => DbError::AccessDenied,
                1617 => DbError::NoSuchChannel,
                _ if message.contains("Errcode: 28") || message.contains("errno: 28") => {
                    DbError::DiskFull
                }
                code => DbError::Sql { code, message },
            }
        }
        mysql_async::Error::Io(e) => DbError::Connection(e.to_string()),
        mysql_async::Error::Driver(e) => DbError::Connection(e.to_string()),
        other => DbError::Connection(other.to_string()),
    }
}

fn get_string(row: &Row, name: &str) -> String {
    row.get::<Option<String>, _>(name).flatten().unwrap_or_default()
}

fn get_u64(row: &Row, name: &str) -> u64 {
    row.get::<Option<u64>, _>(name).flatten().unwrap_or(0)
}

/// Channel clause for START/STOP/RESET SLAVE.
fn channel_clause(is_mariadb: bool, channel: &str) -> String {
    if channel.is_empty() {
        String::new()
    } else if is_mariadb {
        format!(" '{}'", channel)
    } else {
        format!(" FOR CHANNEL '{}'", channel)
    }
}

fn build_change_master(is_mariadb: bool, opt: &ChangeMasterOpt) -> String {
    let mut stmt = String::from("CHANGE MASTER");
    if is_mariadb && !opt.channel.is_empty() {
        stmt.push_str(&format!(" '{}'", opt.channel));
    }
    stmt.push_str(&format!(
        " TO MASTER_HOST='{}', MASTER_PORT={}, MASTER_USER='{}', MASTER_PASSWORD='{}', MASTER_CONNECT_RETRY={}, MASTER_HEARTBEAT_PERIOD={}",
        opt.host, opt.port, opt.user, opt.password, opt.retry, opt.heartbeat_secs
    ));
    match &opt.mode {
        MasterUseGtid::SlavePos => stmt.push_str(", MASTER_USE_GTID=slave_pos"),
        MasterUseGtid::CurrentPos => stmt.push_str(", MASTER_USE_GTID=current_pos"),
        MasterUseGtid::AutoPosition => stmt.push_str(", MASTER_AUTO_POSITION=1"),
        MasterUseGtid::Positional { file, pos } => {
            stmt.push_str(&format!(
                ", MASTER_LOG_FILE='{}', MASTER_LOG_POS={}",
                file, pos
            ));
        }
    }
    if opt.ssl {
        stmt.push_str(", MASTER_SSL=1");
    }
    if opt.delayed && opt.delay_secs > 0 {
        stmt.push_str(&format!(", MASTER_DELAY={}", opt.delay_secs));
    }
    if !is_mariadb && !opt.channel.is_empty() {
        stmt.push_str(&format!(" FOR CHANNEL '{}'", opt.channel));
    }
    stmt
}

/// Connector producing [`MysqlClient`] connections.
pub struct MysqlConnector;

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<Arc<dyn DatabaseClient>, DbError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(credentials.user.clone()))
            .pass(Some(credentials.password.clone()))
            .prefer_socket(false);

        let mut conn = Conn::new(opts).await.map_err(map_err)?;
        let version_str: Option<String> = conn
            .query_first("SELECT VERSION()")
            .await
            .map_err(map_err)?;
        let version = ServerVersion::parse(version_str.as_deref().unwrap_or(""));

        Ok(Arc::new(MysqlClient {
            conn: Mutex::new(conn),
            version,
        }))
    }
}

/// A live connection to one server.
pub struct MysqlClient {
    conn: Mutex<Conn>,
    version: ServerVersion,
}

impl MysqlClient {
    fn is_mariadb(&self) -> bool {
        self.version.is_mariadb()
    }

    fn channel_clause(&self, channel: &str) -> String {
        channel_clause(self.is_mariadb(), channel)
    }

    async fn query_map(&self, stmt: &str) -> Result<HashMap<String, String>, DbError> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = conn.query(stmt).await.map_err(map_err)?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: Option<String> = row.get(0);
            let value: Option<Option<String>> = row.get(1);
            if let Some(name) = name {
                map.insert(name.to_uppercase(), value.flatten().unwrap_or_default());
            }
        }
        Ok(map)
    }

    fn slave_status_from_row(row: &Row) -> SlaveStatus {
        SlaveStatus {
            connection_name: get_string(row, "Connection_name"),
            master_host: get_string(row, "Master_Host"),
            master_port: get_u64(row, "Master_Port") as u16,
            master_server_id: get_u64(row, "Master_Server_Id"),
            slave_io_running: get_string(row, "Slave_IO_Running").eq_ignore_ascii_case("yes"),
            slave_sql_running: get_string(row, "Slave_SQL_Running").eq_ignore_ascii_case("yes"),
            seconds_behind_master: row
                .get::<Option<u64>, _>("Seconds_Behind_Master")
                .flatten(),
            master_log_file: get_string(row, "Master_Log_File"),
            read_master_log_pos: get_u64(row, "Read_Master_Log_Pos"),
            relay_master_log_file: get_string(row, "Relay_Master_Log_File"),
            exec_master_log_pos: get_u64(row, "Exec_Master_Log_Pos"),
            last_io_error: get_string(row, "Last_IO_Error"),
            last_sql_error: get_string(row, "Last_SQL_Error"),
            using_gtid: {
                let raw = get_string(row, "Using_Gtid");
                if raw.is_empty() {
                    None
                } else {
                    Some(UsingGtid::from_str_report(&raw))
                }
            },
            gtid_io_pos: get_string(row, "Gtid_IO_Pos"),
            gtid_slave_pos: get_string(row, "Gtid_Slave_Pos"),
            executed_gtid_set: get_string(row, "Executed_Gtid_Set"),
            slave_sql_running_state: get_string(row, "Slave_SQL_Running_State"),
        }
    }
}

#[async_trait]
impl DatabaseClient for MysqlClient {
    async fn ping(&self) -> Result<(), DbError> {
        self.conn.lock().await.ping().await.map_err(map_err)
    }

    async fn get_version(&self) -> Result<ServerVersion, DbError> {
        Ok(self.version.clone())
    }

    async fn get_variables(&self) -> Result<HashMap<String, String>, DbError> {
        self.query_map("SHOW GLOBAL VARIABLES").await
    }

    async fn get_status(&self) -> Result<HashMap<String, String>, DbError> {
        self.query_map("SHOW GLOBAL STATUS").await
    }

    async fn get_variable(&self, name: &str) -> Result<String, DbError> {
        let mut conn = self.conn.lock().await;
        let row: Option<Row> = conn
            .query_first(format!("SHOW GLOBAL VARIABLES LIKE '{}'", name))
            .await
            .map_err(map_err)?;
        row.map(|r| get_string(&r, "Value")).ok_or(DbError::NoRows)
    }

    async fn get_master_status(&self) -> Result<MasterStatus, DbError> {
        let mut conn = self.conn.lock().await;
        let row: Option<Row> = conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(map_err)?;
        let row = row.ok_or(DbError::NoRows)?;
        Ok(MasterStatus {
            file: get_string(&row, "File"),
            position: get_u64(&row, "Position"),
        })
    }

    async fn get_binary_logs(&self) -> Result<Vec<String>, DbError> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = conn.query("SHOW BINARY LOGS").await.map_err(map_err)?;
        Ok(rows.iter().map(|r| get_string(r, "Log_name")).collect())
    }

    async fn get_binlog_dump_threads(&self) -> Result<usize, DbError> {
        let mut conn = self.conn.lock().await;
        let count: Option<u64> = conn
            .query_first(
                "SELECT COUNT(*) FROM information_schema.processlist \
                 WHERE command LIKE 'Binlog Dump%'",
            )
            .await
            .map_err(map_err)?;
        Ok(count.unwrap_or(0) as usize)
    }

    async fn get_all_slave_status(&self) -> Result<Vec<SlaveStatus>, DbError> {
        let stmt = if self.is_mariadb() {
            "SHOW ALL SLAVES STATUS"
        } else {
            "SHOW SLAVE STATUS"
        };
        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = conn.query(stmt).await.map_err(map_err)?;
        Ok(rows.iter().map(Self::slave_status_from_row).collect())
    }

    async fn get_processlist(&self) -> Result<Vec<ProcessEntry>, DbError> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = conn
            .query(
                "SELECT id, user, host, db, command, time, state, info \
                 FROM information_schema.processlist",
            )
            .await
            .map_err(map_err)?;
        Ok(rows
            .iter()
            .map(|row| ProcessEntry {
                id: get_u64(row, "id"),
                user: get_string(row, "user"),
                host: get_string(row, "host"),
                db: row.get::<Option<String>, _>("db").flatten(),
                command: get_string(row, "command"),
                time_secs: get_u64(row, "time"),
                state: row.get::<Option<String>, _>("state").flatten(),
                info: row.get::<Option<String>, _>("info").flatten(),
            })
            .collect())
    }

    async fn get_innodb_status(&self) -> Result<String, DbError> {
        let mut conn = self.conn.lock().await;
        let row: Option<Row> = conn
            .query_first("SHOW ENGINE INNODB STATUS")
            .await
            .map_err(map_err)?;
        Ok(row.map(|r| get_string(&r, "Status")).unwrap_or_default())
    }

    async fn get_event_status(&self) -> Result<Vec<EventEntry>, DbError> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = conn
            .query("SELECT db, name, definer, status FROM mysql.event")
            .await
            .map_err(map_err)?;
        Ok(rows
            .iter()
            .map(|row| EventEntry {
                db: get_string(row, "db"),
                name: get_string(row, "name"),
                definer: get_string(row, "definer"),
                status: get_string(row, "status"),
            })
            .collect())
    }

    async fn get_users(&self) -> Result<Vec<Grant>, DbError> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = conn
            .query("SELECT user, host FROM mysql.user")
            .await
            .map_err(map_err)?;
        Ok(rows
            .iter()
            .map(|row| Grant {
                user: get_string(row, "user"),
                host: get_string(row, "host"),
            })
            .collect())
    }

    async fn get_plugins(&self) -> Result<Vec<Plugin>, DbError> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<Row> = conn.query("SHOW PLUGINS").await.map_err(map_err)?;
        Ok(rows
            .iter()
            .map(|row| Plugin {
                name: get_string(row, "Name"),
                status: get_string(row, "Status"),
                library: row.get::<Option<String>, _>("Library").flatten(),
            })
            .collect())
    }

    async fn check_privileges(&self, _user: &str) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop("SHOW GRANTS").await.map_err(map_err)
    }

    async fn set_read_only(&self, on: bool) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        let value = if on { "ON" } else { "OFF" };
        conn.query_drop(format!("SET GLOBAL read_only={}", value))
            .await
            .map_err(map_err)
    }

    async fn flush_tables(&self) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop("FLUSH TABLES").await.map_err(map_err)
    }

    async fn reset_master(&self) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop("RESET MASTER").await.map_err(map_err)
    }

    async fn stop_slave(&self, channel: &str) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop(format!("STOP SLAVE{}", self.channel_clause(channel)))
            .await
            .map_err(map_err)
    }

    async fn stop_all_slaves(&self) -> Result<(), DbError> {
        let stmt = if self.is_mariadb() {
            "STOP ALL SLAVES"
        } else {
            // MySQL stops every channel with the bare statement.
            "STOP SLAVE"
        };
        let mut conn = self.conn.lock().await;
        conn.query_drop(stmt).await.map_err(map_err)
    }

    async fn start_slave(&self, channel: &str) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop(format!("START SLAVE{}", self.channel_clause(channel)))
            .await
            .map_err(map_err)
    }

    async fn reset_slave(&self, channel: &str, all: bool) -> Result<(), DbError> {
        let stmt = if self.is_mariadb() {
            format!(
                "RESET SLAVE{}{}",
                self.channel_clause(channel),
                if all { " ALL" } else { "" }
            )
        } else {
            format!(
                "RESET SLAVE{}{}",
                if all { " ALL" } else { "" },
                self.channel_clause(channel)
            )
        };
        let mut conn = self.conn.lock().await;
        conn.query_drop(stmt).await.map_err(map_err)
    }

    async fn set_default_master_conn(&self, channel: &str) -> Result<(), DbError> {
        if !self.is_mariadb() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        conn.query_drop(format!("SET default_master_connection='{}'", channel))
            .await
            .map_err(map_err)
    }

    async fn set_gtid_slave_pos(&self, gtid: &GtidList) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop(format!("SET GLOBAL gtid_slave_pos=\"{}\"", gtid))
            .await
            .map_err(map_err)
    }

    async fn change_master(&self, opt: ChangeMasterOpt) -> Result<(), DbError> {
        let stmt = build_change_master(self.is_mariadb(), &opt);
        let mut conn = self.conn.lock().await;
        conn.query_drop(stmt).await.map_err(map_err)
    }

    async fn skip_replication_event(&self, channel: &str) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        if self.is_mariadb() && !channel.is_empty() {
            conn.query_drop(format!("SET default_master_connection='{}'", channel))
                .await
                .map_err(map_err)?;
        }
        conn.query_drop("SET GLOBAL sql_slave_skip_counter=1")
            .await
            .map_err(map_err)
    }

    async fn long_running_writes(&self, min_secs: u64) -> Result<usize, DbError> {
        let mut conn = self.conn.lock().await;
        let count: Option<u64> = conn
            .query_first(format!(
                "SELECT COUNT(*) FROM information_schema.processlist \
                 WHERE command = 'Query' AND time >= {} AND info NOT LIKE 'select%'",
                min_secs
            ))
            .await
            .map_err(map_err)?;
        Ok(count.unwrap_or(0) as usize)
    }

    async fn kill_threads(&self) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        let own_id = conn.id();
        let ids: Vec<u64> = conn
            .query(
                "SELECT id FROM information_schema.processlist \
                 WHERE command NOT IN ('Binlog Dump', 'Daemon')",
            )
            .await
            .map_err(map_err)?;
        for id in ids {
            if id == own_id as u64 {
                continue;
            }
            // A thread may exit between the listing and the kill.
            let _ = conn.query_drop(format!("KILL {}", id)).await;
        }
        Ok(())
    }

    async fn set_max_connections(&self, value: u64) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop(format!("SET GLOBAL max_connections={}", value))
            .await
            .map_err(map_err)
    }

    async fn shutdown_server(&self, wait_for_slaves: bool) -> Result<(), DbError> {
        let stmt = if wait_for_slaves && self.is_mariadb() && self.version.greater_equal(10, 4) {
            "SHUTDOWN WAIT FOR ALL SLAVES"
        } else {
            "SHUTDOWN"
        };
        let mut conn = self.conn.lock().await;
        match conn.query_drop(stmt).await {
            Ok(()) => Ok(()),
            // The connection drops as the server goes down.
            Err(mysql_async::Error::Io(_)) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(channel: &str, mode: MasterUseGtid) -> ChangeMasterOpt {
        ChangeMasterOpt {
            host: "db1".into(),
            port: 3306,
            user: "repl".into(),
            password: "secret".into(),
            channel: channel.into(),
            mode,
            retry: 10,
            heartbeat_secs: 3,
            ssl: false,
            delayed: false,
            delay_secs: 0,
        }
    }

    #[test]
    fn test_change_master_statement_mariadb_gtid() {
        let stmt = build_change_master(true, &opt("main", MasterUseGtid::SlavePos));
        assert!(stmt.starts_with("CHANGE MASTER 'main' TO MASTER_HOST='db1'"));
        assert!(stmt.contains("MASTER_USE_GTID=slave_pos"));
        assert!(!stmt.contains("FOR CHANNEL"));
    }

    #[test]
    fn test_change_master_statement_mysql_channel() {
        let stmt = build_change_master(false, &opt("main", MasterUseGtid::AutoPosition));
        assert!(stmt.contains("MASTER_AUTO_POSITION=1"));
        assert!(stmt.ends_with("FOR CHANNEL 'main'"));
    }

    #[test]
    fn test_change_master_statement_positional() {
        let mut o = opt("", MasterUseGtid::Positional {
            file: "mysql-bin.000007".into(),
            pos: 1234,
        });
        o.ssl = true;
        o.delayed = true;
        o.delay_secs = 3600;
        let stmt = build_change_master(true, &o);
        assert!(stmt.contains("MASTER_LOG_FILE='mysql-bin.000007'"));
        assert!(stmt.contains("MASTER_LOG_POS=1234"));
        assert!(stmt.contains("MASTER_SSL=1"));
        assert!(stmt.contains("MASTER_DELAY=3600"));
    }

    #[test]
    fn test_channel_clause_dialects() {
        assert_eq!(channel_clause(true, "main"), " 'main'");
        assert_eq!(channel_clause(false, "main"), " FOR CHANNEL 'main'");
        assert_eq!(channel_clause(true, ""), "");
    }
}
