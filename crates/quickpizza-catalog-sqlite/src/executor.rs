//! Async front for [`SqliteCatalog`].
//!
//! The catalog is owned by a dedicated thread; callers submit closures over a
//! channel and await the result on a oneshot, so no lock is held across an
//! await point. Every submitted call runs under a child of the caller's
//! [`Context`] that is cancelled if the awaiting future is dropped, which
//! interrupts the statement the thread is running on its behalf.

use std::sync::mpsc;
use std::thread;

use quickpizza_core::{
    BoundedTable, CancelHandle, Context, Dough, Ingredient, NewPizza, NewRating, NewUser, Pizza,
    PizzaId, Rating, User, UserId,
};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{CatalogError, SqliteCatalog, TableCounts};

type Job = Box<dyn FnOnce(&SqliteCatalog) + Send + 'static>;

pub struct CatalogExecutor {
    sender: mpsc::Sender<Job>,
    _handle: thread::JoinHandle<()>,
}

impl CatalogExecutor {
    /// Move `catalog` onto its own thread.
    #[must_use]
    pub fn new(catalog: SqliteCatalog) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();

        let handle = thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                job(&catalog);
            }
            debug!("catalog executor stopped");
        });

        Self { sender, _handle: handle }
    }

    /// Run `op` on the catalog thread.
    ///
    /// # Errors
    /// Returns whatever `op` returns, or [`CatalogError::ExecutorClosed`] when
    /// the catalog thread is gone.
    pub async fn run<F, T>(&self, ctx: &Context, op: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&SqliteCatalog, &Context) -> Result<T, CatalogError> + Send + 'static,
        T: Send + 'static,
    {
        let call_ctx = ctx.child();
        let guard = CancelOnDrop::new(call_ctx.cancel_handle());
        let (response_tx, response_rx) = oneshot::channel();

        let job: Job = Box::new(move |catalog| {
            let _ = response_tx.send(op(catalog, &call_ctx));
        });
        self.sender.send(job).map_err(|_| CatalogError::ExecutorClosed)?;

        let result = response_rx.await.map_err(|_| CatalogError::ExecutorClosed)?;
        guard.disarm();
        result
    }

    /// # Errors
    /// See [`SqliteCatalog::record_user`].
    pub async fn record_user(
        &self,
        ctx: &Context,
        candidate: NewUser,
    ) -> Result<User, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.record_user(ctx, candidate)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::login_user`].
    pub async fn login_user(
        &self,
        ctx: &Context,
        username: String,
        password: String,
    ) -> Result<Option<User>, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.login_user(ctx, &username, &password)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::authenticate_token`].
    pub async fn authenticate_token(
        &self,
        ctx: &Context,
        token: String,
    ) -> Result<Option<User>, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.authenticate_token(ctx, &token)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::record_recommendation`].
    pub async fn record_recommendation(
        &self,
        ctx: &Context,
        pizza: NewPizza,
    ) -> Result<Pizza, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.record_recommendation(ctx, pizza)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::record_rating`].
    pub async fn record_rating(
        &self,
        ctx: &Context,
        user_id: UserId,
        rating: NewRating,
    ) -> Result<Rating, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.record_rating(ctx, user_id, rating)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::get_ingredients`].
    pub async fn get_ingredients(
        &self,
        ctx: &Context,
        ingredient_type: String,
    ) -> Result<Vec<Ingredient>, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.get_ingredients(ctx, &ingredient_type)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::get_doughs`].
    pub async fn get_doughs(&self, ctx: &Context) -> Result<Vec<Dough>, CatalogError> {
        self.run(ctx, |catalog, ctx| catalog.get_doughs(ctx)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::get_tools`].
    pub async fn get_tools(&self, ctx: &Context) -> Result<Vec<String>, CatalogError> {
        self.run(ctx, |catalog, ctx| catalog.get_tools(ctx)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::get_history`].
    pub async fn get_history(&self, ctx: &Context, limit: u32) -> Result<Vec<Pizza>, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.get_history(ctx, limit)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::get_recommendation`].
    pub async fn get_recommendation(
        &self,
        ctx: &Context,
        id: PizzaId,
    ) -> Result<Option<Pizza>, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.get_recommendation(ctx, id)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::get_ratings`].
    pub async fn get_ratings(
        &self,
        ctx: &Context,
        user_id: UserId,
    ) -> Result<Vec<Rating>, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.get_ratings(ctx, user_id)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::enforce_limits`].
    pub async fn enforce_limits(
        &self,
        ctx: &Context,
        table: BoundedTable,
    ) -> Result<usize, CatalogError> {
        self.run(ctx, move |catalog, ctx| catalog.enforce_limits(ctx, table)).await
    }

    /// # Errors
    /// See [`SqliteCatalog::table_counts`].
    pub async fn table_counts(&self, ctx: &Context) -> Result<TableCounts, CatalogError> {
        self.run(ctx, |catalog, ctx| catalog.table_counts(ctx)).await
    }
}

/// Cancels the call's context unless disarmed after the result arrived.
struct CancelOnDrop {
    handle: Option<CancelHandle>,
}

impl CancelOnDrop {
    fn new(handle: CancelHandle) -> Self {
        Self { handle: Some(handle) }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}
