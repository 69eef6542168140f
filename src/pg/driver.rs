//! The connection contract seen by a query builder or a connection pool.
//!
//! Callers above the driver only need to run statements, iterate rows and
//! learn whether a connection must be thrown away. [`PgConnection`] and
//! [`Rows`] implement these traits by delegating to their inherent methods.

use super::connection::{ExecResult, PgConnection};
use super::error::PgResult;
use super::framing::Context;
use super::rows::{Row, Rows};
use super::types::PgValue;

/// A single-owner database connection.
#[allow(async_fn_in_trait)]
pub trait DriverConn {
    type Rows<'a>: DriverRows
    where
        Self: 'a;

    async fn exec_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[PgValue],
    ) -> PgResult<ExecResult>;

    async fn query_context<'a>(
        &'a mut self,
        ctx: &Context,
        query: &str,
        args: &[PgValue],
    ) -> PgResult<Self::Rows<'a>>;

    async fn ping(&mut self, ctx: &Context) -> PgResult<()>;

    async fn close(&mut self) -> PgResult<()>;

    /// Whether the connection must be discarded instead of reused.
    fn is_bad(&self) -> bool;
}

/// A forward-only result cursor.
#[allow(async_fn_in_trait)]
pub trait DriverRows {
    fn columns(&self) -> &[String];

    async fn next(&mut self) -> PgResult<Option<Row>>;

    async fn close(&mut self) -> PgResult<()>;
}

impl DriverConn for PgConnection {
    type Rows<'a> = Rows<'a>;

    async fn exec_context(
        &mut self,
        ctx: &Context,
        query: &str,
        args: &[PgValue],
    ) -> PgResult<ExecResult> {
        self.exec_args(ctx, query, args).await
    }

    async fn query_context<'a>(
        &'a mut self,
        ctx: &Context,
        query: &str,
        args: &[PgValue],
    ) -> PgResult<Rows<'a>> {
        self.query_args(ctx, query, args).await
    }

    async fn ping(&mut self, ctx: &Context) -> PgResult<()> {
        PgConnection::ping(self, ctx).await
    }

    async fn close(&mut self) -> PgResult<()> {
        PgConnection::close(self).await
    }

    fn is_bad(&self) -> bool {
        PgConnection::is_bad(self)
    }
}

impl DriverRows for Rows<'_> {
    fn columns(&self) -> &[String] {
        Rows::columns(self)
    }

    async fn next(&mut self) -> PgResult<Option<Row>> {
        Rows::next(self).await
    }

    async fn close(&mut self) -> PgResult<()> {
        Rows::close(self).await
    }
}
