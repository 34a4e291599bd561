/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepConfig {
    /// Target mean acceptance probability of a trajectory.
    pub delta: f64,
    pub gamma: f64,
    pub t0: f64,
    pub kappa: f64,
}

impl Default for StepConfig {
    fn default() -> StepConfig {
        StepConfig {
            delta: 0.8,
            gamma: 0.05,
            t0: 10.,
            kappa: 0.75,
        }
    }
}

/// Dual averaging of the log step size towards a target acceptance probability.
#[derive(Debug, Clone)]
pub struct StepAdapter {
    pub(crate) log_eps: f64,
    pub(crate) log_eps_bar: f64,
    hbar: f64,
    mu: f64,
    counter: u64,
    config: StepConfig,
}

impl StepAdapter {
    pub fn new(config: StepConfig, log_eps: f64) -> StepAdapter {
        let mut adapter = StepAdapter {
            log_eps,
            log_eps_bar: 0.,
            hbar: 0.,
            mu: 0.,
            counter: 0,
            config,
        };
        adapter.init(log_eps);
        adapter
    }

    /// Start a new adaptation around `log_eps`.
    pub fn init(&mut self, log_eps: f64) {
        self.log_eps = log_eps;
        self.mu = 10f64.ln() + log_eps;
    }

    pub fn reset(&mut self) {
        self.counter = 0;
        self.log_eps_bar = 0.;
        self.hbar = 0.;
    }

    /// Update with the mean acceptance probability of the last trajectory.
    pub fn adapt(&mut self, alpha: f64) {
        self.counter += 1;
        let alpha = alpha.min(1.);
        let count = self.counter as f64;
        let w = 1. / (count + self.config.t0);
        self.hbar = (1. - w) * self.hbar + w * (self.config.delta - alpha);
        self.log_eps = self.mu - count.sqrt() / self.config.gamma * self.hbar;
        let mk = count.powf(-self.config.kappa);
        self.log_eps_bar = mk * self.log_eps + (1. - mk) * self.log_eps_bar;
    }

    /// Use the averaged step size from now on.
    pub fn finalize(&mut self) {
        self.log_eps = self.log_eps_bar;
    }

    pub fn step_size(&self) -> f64 {
        self.log_eps.exp()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub(crate) fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }
}
