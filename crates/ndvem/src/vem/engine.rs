//! Reference vector engine: keeps typed allocations and answers bridge requests.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use crate::array::kernel::{eval_checked, KernelInput};
use crate::array::{DType, Element, KernelError, Layout, Opcode, Shape};

use super::protocol::{
    BatchFailure, BatchSource, BatchStep, Payload, RemoteHandle, RemoteOperand, Request,
    Response, PROTOCOL_VERSION,
};

struct Allocation {
    dtype: DType,
    bits: Vec<u64>,
}

/// In-memory engine state. The `ndvem-engine` binary serves one over stdio; the loopback
/// transport embeds one directly.
pub struct VemEngine {
    name: String,
    next_handle: u64,
    arrays: HashMap<RemoteHandle, Allocation>,
    shutdown: bool,
}

impl Default for VemEngine {
    fn default() -> Self {
        Self::new("ndvem-reference")
    }
}

impl VemEngine {
    pub fn new(name: impl Into<String>) -> Self {
        VemEngine {
            name: name.into(),
            next_handle: 1,
            arrays: HashMap::new(),
            shutdown: false,
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn handle(&mut self, request: Request) -> Response {
        log::trace!("engine request {}", request.name());
        match self.serve(request) {
            Ok(response) => response,
            Err(error) => Response::Error { error },
        }
    }

    fn serve(&mut self, request: Request) -> Result<Response, KernelError> {
        match request {
            Request::Hello { .. } => Ok(Response::Ready {
                engine: self.name.clone(),
                protocol: PROTOCOL_VERSION,
            }),
            Request::Allocate { dtype, shape } => {
                let bits = vec![0u64; shape.num_elements()];
                Ok(Response::Allocated {
                    handle: self.insert(dtype, bits),
                })
            }
            Request::Upload { handle, payload } => {
                let array = self.lookup_mut(handle)?;
                if array.dtype != payload.dtype {
                    return Err(KernelError::DType {
                        expected: array.dtype,
                        found: payload.dtype,
                    });
                }
                if array.bits.len() != payload.len() {
                    return Err(KernelError::Engine(format!(
                        "upload of {} elements into allocation of {}",
                        payload.len(),
                        array.bits.len()
                    )));
                }
                array.bits = payload.bits;
                Ok(Response::Done)
            }
            Request::Dispatch {
                op,
                dtype,
                shape,
                operands,
            } => Ok(Response::Allocated {
                handle: self.dispatch(op, dtype, &shape, &operands)?,
            }),
            Request::Batch { dtype, steps } => Ok(self.batch(dtype, steps)),
            Request::Fetch { handle } => {
                let array = self.lookup(handle)?;
                Ok(Response::Data {
                    payload: Payload {
                        dtype: array.dtype,
                        bits: array.bits.clone(),
                    },
                })
            }
            Request::ReadElement { handle, offset } => {
                let array = self.lookup(handle)?;
                let bits = *array.bits.get(offset).ok_or(KernelError::OutOfRange {
                    max_offset: offset,
                    len: array.bits.len(),
                })?;
                Ok(Response::Element { bits })
            }
            Request::WriteElement {
                handle,
                offset,
                bits,
            } => {
                let array = self.lookup_mut(handle)?;
                let len = array.bits.len();
                let slot = array.bits.get_mut(offset).ok_or(KernelError::OutOfRange {
                    max_offset: offset,
                    len,
                })?;
                *slot = bits;
                Ok(Response::Done)
            }
            Request::Release { handle } => {
                self.arrays.remove(&handle);
                Ok(Response::Done)
            }
            Request::Shutdown => {
                self.arrays.clear();
                self.shutdown = true;
                Ok(Response::Done)
            }
        }
    }

    fn insert(&mut self, dtype: DType, bits: Vec<u64>) -> RemoteHandle {
        let handle = RemoteHandle(self.next_handle);
        self.next_handle += 1;
        self.arrays.insert(handle, Allocation { dtype, bits });
        handle
    }

    fn lookup(&self, handle: RemoteHandle) -> Result<&Allocation, KernelError> {
        self.arrays
            .get(&handle)
            .ok_or_else(|| KernelError::Engine(format!("unknown handle {}", handle.0)))
    }

    fn lookup_mut(&mut self, handle: RemoteHandle) -> Result<&mut Allocation, KernelError> {
        self.arrays
            .get_mut(&handle)
            .ok_or_else(|| KernelError::Engine(format!("unknown handle {}", handle.0)))
    }

    fn dispatch(
        &mut self,
        op: Opcode,
        dtype: DType,
        shape: &Shape,
        operands: &[RemoteOperand],
    ) -> Result<RemoteHandle, KernelError> {
        let bits = match dtype {
            DType::F32 => self.dispatch_typed::<f32>(op, shape, operands)?,
            DType::F64 => self.dispatch_typed::<f64>(op, shape, operands)?,
            DType::I32 => self.dispatch_typed::<i32>(op, shape, operands)?,
            DType::I64 => self.dispatch_typed::<i64>(op, shape, operands)?,
        };
        Ok(self.insert(dtype, bits))
    }

    /// Runs `steps` in order and stops at the first one that fails.
    fn batch(&mut self, dtype: DType, steps: Vec<BatchStep>) -> Response {
        let mut handles: Vec<RemoteHandle> = Vec::with_capacity(steps.len());
        for (index, step) in steps.into_iter().enumerate() {
            let result = step
                .operands
                .into_iter()
                .map(|operand| {
                    let handle = match operand.source {
                        BatchSource::Handle(handle) => handle,
                        BatchSource::Step(earlier) if earlier < index => handles[earlier],
                        BatchSource::Step(other) => {
                            return Err(KernelError::Engine(format!(
                                "batch step {index} reads step {other} before it ran"
                            )))
                        }
                    };
                    Ok(RemoteOperand {
                        handle,
                        layout: operand.layout,
                    })
                })
                .collect::<Result<Vec<_>, KernelError>>()
                .and_then(|operands| self.dispatch(step.op, dtype, &step.shape, &operands));
            match result {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    return Response::Batched {
                        handles,
                        failure: Some(BatchFailure { step: index, error }),
                    }
                }
            }
        }
        Response::Batched {
            handles,
            failure: None,
        }
    }

    fn dispatch_typed<T: Element>(
        &self,
        op: Opcode,
        shape: &Shape,
        operands: &[RemoteOperand],
    ) -> Result<Vec<u64>, KernelError> {
        let decoded: Vec<(Vec<T>, &Layout)> = operands
            .iter()
            .map(|operand| {
                let array = self.lookup(operand.handle)?;
                let payload = Payload {
                    dtype: array.dtype,
                    bits: array.bits.clone(),
                };
                Ok((payload.decode::<T>()?, &operand.layout))
            })
            .collect::<Result<_, KernelError>>()?;
        let inputs: Vec<KernelInput<'_, T>> = decoded
            .iter()
            .map(|(data, layout)| KernelInput::new(data, layout))
            .collect();
        let out = eval_checked(op, shape, &inputs)?;
        Ok(out.into_iter().map(Element::to_bits).collect())
    }
}

/// Serves newline-delimited requests until `Shutdown` or end of input.
pub fn serve<R: BufRead, W: Write>(
    engine: &mut VemEngine,
    reader: R,
    mut writer: W,
) -> io::Result<()> {
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => engine.handle(request),
            Err(err) => Response::Error {
                error: KernelError::Engine(format!("malformed request: {err}")),
            },
        };
        let encoded = serde_json::to_string(&response)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        writeln!(writer, "{encoded}")?;
        writer.flush()?;
        if engine.is_shutdown() {
            break;
        }
    }
    Ok(())
}
