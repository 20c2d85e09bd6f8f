//! A standard attack/decay/sustain/release envelope generator, sample-rate
//! driven. Mirrors the shape of the JUCE `ADSR` the original voice code drives
//! (`setSampleRate`, `setParameters`, `noteOn`, `noteOff`, `getNextSample`).

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrParameters {
    pub attack_seconds: f32,
    pub decay_seconds: f32,
    pub sustain_level: f32,
    pub release_seconds: f32,
}

impl Default for AdsrParameters {
    fn default() -> Self {
        Self { attack_seconds: 0.01, decay_seconds: 0.1, sustain_level: 1.0, release_seconds: 0.05 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

#[derive(Debug, Clone)]
pub struct Adsr {
    sample_rate: f32,
    params: AdsrParameters,
    stage: Stage,
    envelope: f32,
    attack_rate: f32,
    decay_rate: f32,
    release_rate: f32,
}

impl Default for Adsr {
    fn default() -> Self {
        Self {
            sample_rate: 44_100.0,
            params: AdsrParameters::default(),
            stage: Stage::Idle,
            envelope: 0.0,
            attack_rate: 0.0,
            decay_rate: 0.0,
            release_rate: 0.0,
        }
    }
}

impl Adsr {
    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate.max(1.0);
        self.recompute_rates();
    }

    pub fn set_parameters(&mut self, params: AdsrParameters) {
        self.params = params;
        self.recompute_rates();
    }

    fn recompute_rates(&mut self) {
        self.attack_rate = 1.0 / (self.params.attack_seconds.max(1e-6) * self.sample_rate);
        self.decay_rate = (1.0 - self.params.sustain_level)
            / (self.params.decay_seconds.max(1e-6) * self.sample_rate);
        self.release_rate = self.params.sustain_level.max(1e-6)
            / (self.params.release_seconds.max(1e-6) * self.sample_rate);
    }

    pub fn note_on(&mut self) {
        self.stage = Stage::Attack;
        self.envelope = 0.0;
    }

    pub fn note_off(&mut self) {
        if self.stage != Stage::Idle {
            self.stage = Stage::Release;
        }
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.envelope = 0.0;
    }

    pub fn is_active(&self) -> bool {
        self.stage != Stage::Idle
    }

    pub fn get_next_sample(&mut self) -> f32 {
        match self.stage {
            Stage::Idle => 0.0,
            Stage::Attack => {
                self.envelope += self.attack_rate;
                if self.envelope >= 1.0 {
                    self.envelope = 1.0;
                    self.stage = Stage::Decay;
                }
                self.envelope
            }
            Stage::Decay => {
                self.envelope -= self.decay_rate;
                if self.envelope <= self.params.sustain_level {
                    self.envelope = self.params.sustain_level;
                    self.stage = Stage::Sustain;
                }
                self.envelope
            }
            Stage::Sustain => self.envelope,
            Stage::Release => {
                self.envelope -= self.release_rate;
                if self.envelope <= 0.0 {
                    self.envelope = 0.0;
                    self.stage = Stage::Idle;
                }
                self.envelope
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attack_rises_to_unity_then_moves_to_decay() {
        let mut adsr = Adsr::default();
        adsr.set_sample_rate(100.0);
        adsr.set_parameters(AdsrParameters {
            attack_seconds: 0.1,
            decay_seconds: 0.1,
            sustain_level: 0.5,
            release_seconds: 0.1,
        });
        adsr.note_on();
        let mut peaked = false;
        for _ in 0..20 {
            if adsr.get_next_sample() >= 1.0 {
                peaked = true;
            }
        }
        assert!(peaked);
        assert_eq!(adsr.stage, Stage::Decay);
    }

    #[test]
    fn release_decays_to_idle() {
        let mut adsr = Adsr::default();
        adsr.set_sample_rate(100.0);
        adsr.note_on();
        for _ in 0..1000 {
            adsr.get_next_sample();
        }
        adsr.note_off();
        for _ in 0..1000 {
            adsr.get_next_sample();
        }
        assert!(!adsr.is_active());
    }

    #[test]
    fn reset_silences_immediately() {
        let mut adsr = Adsr::default();
        adsr.note_on();
        adsr.get_next_sample();
        adsr.reset();
        assert_eq!(adsr.get_next_sample(), 0.0);
        assert!(!adsr.is_active());
    }
}
