//! Rate-limited HTTP client for the catalog API.
//!
//! Wraps `reqwest::Client` to add:
//! * A request quota of 50 calls per 5-second interval
//! * Consistent timeouts and `User-Agent`
//!
//! Requests that would exceed the quota are delayed rather than refused,
//! and bursts up to the full quota are allowed.

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{Body, Method, Url};

use crate::{
    config::Config,
    error::{Error, Result},
};

pub struct Client {
    /// Client without rate limiting.
    unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Catalog calls such as station generation can take a while to answer.
    const TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(Self::TIMEOUT)
            .user_agent(&config.user_agent)
            .build()?;

        // Rate limit own requests as to not overload the catalog.
        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .ok_or_else(|| Error::internal("quota time interval is zero"))?
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .ok_or_else(|| Error::internal("calls per interval is zero"))?,
            );

        Ok(Self {
            unlimited: http_client,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a request with specified method, URL and body.
    pub fn request<U, T>(&self, method: Method, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url.into());
        *request.body_mut() = Some(body.into());
        request
    }

    pub fn post<U, T>(&self, url: U, body: T) -> reqwest::Request
    where
        U: Into<Url>,
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Executes a request once the rate limiter allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or times out.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}
