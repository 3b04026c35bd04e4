use crate::error::{Error, Result};

/// Default capacity of a [`TaskManager`](crate::scheduler::TaskManager).
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

const MAX_THREADS: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker count for a [`ThreadPool`](crate::executor::ThreadPool).
    /// `None` uses host parallelism.
    pub num_threads: Option<usize>,
    pub max_concurrency: usize,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,
    /// How many times an idle worker yields before it starts napping.
    pub idle_yields: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "task-engine".to_string(),
            idle_yields: 16,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.num_threads {
            if n == 0 {
                return Err(Error::config("num_threads must be > 0"));
            }
            if n > MAX_THREADS {
                return Err(Error::config("num_threads too large (max 1024)"));
            }
        }

        if self.max_concurrency == 0 {
            return Err(Error::config("max_concurrency must be > 0"));
        }

        if self.stack_size == Some(0) {
            return Err(Error::config("stack_size must be > 0"));
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(num_cpus::get)
    }

    pub(crate) fn thread_builder(&self, name: String) -> std::thread::Builder {
        let builder = std::thread::Builder::new().name(name);
        match self.stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.num_threads = Some(n);
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn idle_yields(mut self, yields: u32) -> Self {
        self.config.idle_yields = yields;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
